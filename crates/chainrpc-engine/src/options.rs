use std::time::Duration;

/// Per-call options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Resend the call after a reconnect instead of failing it
    pub resend_on_reconnect: bool,
    /// Overrides `requests.default_timeout_seconds` from the engine config
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn resend_on_reconnect(mut self) -> Self {
        self.resend_on_reconnect = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-subscription options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Method sent with `[remote_id]` when an acknowledged subscription is
    /// canceled or terminated by its handler
    pub unsubscribe_method: Option<String>,
    /// Overrides `requests.resend_subscriptions` from the engine config
    pub resend_on_reconnect: Option<bool>,
}

impl SubscriptionOptions {
    pub fn with_unsubscribe(method: impl Into<String>) -> Self {
        Self {
            unsubscribe_method: Some(method.into()),
            resend_on_reconnect: None,
        }
    }

    pub fn resend_on_reconnect(mut self, resend: bool) -> Self {
        self.resend_on_reconnect = Some(resend);
        self
    }
}
