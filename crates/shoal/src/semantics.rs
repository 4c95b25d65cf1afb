//! Policy bundle governing how a batch executes: how strongly the server
//! must acknowledge operations, how visible they are to other clients,
//! whether they apply atomically, and how far the pipeline may reorder
//! them for merging.

/// Strength of the server acknowledgment a client waits for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Safety {
    /// Fire and forget: no reply is requested.
    None,
    /// Reply once the server has received the operations.
    Network,
    /// Reply once the server has persisted the operations.
    Storage,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Consistency {
    Immediate,
    Session,
    Eventual,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Atomicity {
    None,
    Operation,
    Batch,
}

/// How far the pipeline may rearrange a batch to merge operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ordering {
    /// Every operation is dispatched on its own, in append order.
    Strict,
    /// Contiguous operations with the same kind and target merge.
    SemiRelaxed,
    /// Operations are regrouped by target and kind before merging.
    Relaxed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Persistency {
    Immediate,
    Eventual,
}

/// Predefined semantics bundles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Template {
    Default,
    Posix,
    TemporaryLocal,
}

/// An immutable bundle of execution policies. Build one from a
/// [`Template`], override individual axes, then hand it to a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Semantics {
    pub safety: Safety,
    pub consistency: Consistency,
    pub atomicity: Atomicity,
    pub ordering: Ordering,
    pub persistency: Persistency,
}

impl Semantics {
    pub fn new(template: Template) -> Self {
        match template {
            Template::Default => Self {
                safety: Safety::Network,
                consistency: Consistency::Immediate,
                atomicity: Atomicity::None,
                ordering: Ordering::SemiRelaxed,
                persistency: Persistency::Immediate,
            },
            Template::Posix => Self {
                safety: Safety::Network,
                consistency: Consistency::Immediate,
                atomicity: Atomicity::Operation,
                ordering: Ordering::Strict,
                persistency: Persistency::Immediate,
            },
            Template::TemporaryLocal => Self {
                safety: Safety::None,
                consistency: Consistency::Eventual,
                atomicity: Atomicity::None,
                ordering: Ordering::Relaxed,
                persistency: Persistency::Eventual,
            },
        }
    }

    pub fn with_safety(mut self, safety: Safety) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_atomicity(mut self, atomicity: Atomicity) -> Self {
        self.atomicity = atomicity;
        self
    }

    pub fn with_ordering(mut self, ordering: Ordering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_persistency(mut self, persistency: Persistency) -> Self {
        self.persistency = persistency;
        self
    }
}

impl Default for Semantics {
    fn default() -> Self {
        Self::new(Template::Default)
    }
}
