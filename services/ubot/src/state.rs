//! Application state shared across request handlers.

use std::sync::Arc;

use crate::caches::NodeCaches;
use crate::node::{NodeContext, UBot};
use crate::processor::ProcessorTable;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    node: Arc<NodeContext>,
    table: Arc<ProcessorTable>,
}

impl AppState {
    pub fn new(node: Arc<NodeContext>, table: Arc<ProcessorTable>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { node, table }),
        }
    }

    pub fn from_ubot(ubot: &UBot) -> Self {
        Self::new(ubot.node().clone(), ubot.table().clone())
    }

    pub fn node(&self) -> &NodeContext {
        &self.inner.node
    }

    pub fn table(&self) -> &Arc<ProcessorTable> {
        &self.inner.table
    }

    pub fn caches(&self) -> &NodeCaches {
        &self.inner.node.caches
    }
}
