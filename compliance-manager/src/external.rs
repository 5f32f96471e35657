use serde_json::Value;

/// A business data store outside this crate that holds personal data.
///
/// The host registers one per store. Export and erasure requests fan out
/// to every registered handler; the manager implements none of them.
pub trait ExternalDataHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Everything the store holds about `user_id`, as JSON.
    fn export(&self, user_id: &str) -> anyhow::Result<Value>;

    /// Remove or pseudonymise the user's data, using `pseudonym` where a
    /// stable replacement id is needed.
    fn erase(&self, user_id: &str, pseudonym: &str) -> anyhow::Result<()>;
}
