//! Acting-user lookup for record provenance.

/// Supplies the id of the user acting on this device.
pub trait IdentityProvider: Send + Sync {
    /// `None` when nobody is signed in; records are then written without
    /// `created_by`/`updated_by`.
    fn current_user_id(&self) -> Option<String>;
}

/// A fixed identity.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

impl<F> IdentityProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn current_user_id(&self) -> Option<String> {
        self()
    }
}
