use dbft_types::Message;
use multisig::{KeyId, Unchecked};

pub(crate) type MessageModifier = Box<dyn FnMut(KeyId, Message<Unchecked>) -> Vec<Message<Unchecked>>>;

/// Intercept a message before a node processes it and apply transformations if any provided.
pub struct Interceptor {
    msg_modifier: MessageModifier,
}

impl Interceptor {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnMut(KeyId, Message<Unchecked>) -> Vec<Message<Unchecked>> + 'static,
    {
        Self {
            msg_modifier: Box::new(f),
        }
    }

    /// Drop every message matching the predicate.
    pub(crate) fn drop_if<F>(mut f: F) -> Self
    where
        F: FnMut(KeyId, &Message<Unchecked>) -> bool + 'static,
    {
        Self::new(move |to, m| if f(to, &m) { Vec::new() } else { vec![m] })
    }

    /// Handle the message addressed to `to` with any defined logic in the test.
    pub(crate) fn intercept_message(&mut self, to: KeyId, msg: Message<Unchecked>) -> Vec<Message<Unchecked>> {
        (self.msg_modifier)(to, msg)
    }
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new(|_, m| vec![m])
    }
}
