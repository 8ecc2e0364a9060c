// SPDX-License-Identifier: Apache-2.0

use crate::persistence::Database;
use crate::plugin::TemplateSet;

/// Default capacity of the bounded queue on each pipeline edge
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Everything an operator factory needs at build time: the plugin template
/// overlay, the database yielding operator-scoped persisters, and the
/// channel capacity for input queues.
pub struct BuildContext {
    pub templates: TemplateSet,
    pub database: Database,
    pub channel_capacity: usize,
}

impl BuildContext {
    pub fn new(database: Database) -> Self {
        Self {
            templates: TemplateSet::default(),
            database,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// A context backed by an in-memory database, for tests and ephemeral
    /// pipelines
    pub fn in_memory() -> Self {
        Self::new(Database::open_in_memory())
    }

    pub fn with_templates(mut self, templates: TemplateSet) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}
