use std::fmt;
use std::sync::Arc;

use super::Context;
use crate::network::Connection;

/// One link of the request chain.
pub type Handler = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// Observer of a connection lifecycle event.
pub type ConnHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Connection lifecycle observers shared by every shard and listener.
#[derive(Clone, Default)]
pub struct Callbacks {
    on_connect: Option<ConnHook>,
    on_disconnect: Option<ConnHook>,
}

impl Callbacks {
    pub fn on_connect(&mut self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        self.on_connect = Some(Arc::new(hook));
    }

    pub fn on_disconnect(&mut self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        self.on_disconnect = Some(Arc::new(hook));
    }

    pub(crate) fn connected(&self, conn: &Connection) {
        if let Some(hook) = &self.on_connect {
            hook(conn);
        }
    }

    pub(crate) fn disconnected(&self, conn: &Connection) {
        if let Some(hook) = &self.on_disconnect {
            hook(conn);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}
