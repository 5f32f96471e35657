/// Reports how many stored items a subsystem still holds sealed under a key.
///
/// The vault consults every registered reporter before retiring a key, so a
/// key is only destroyed once nobody depends on it.
pub trait UsageReporter: Send + Sync {
    fn name(&self) -> &str;

    fn outstanding(&self, key_id: &str) -> usize;
}
