/// Error that can be counted in the reconcile failure metrics.
pub trait TraceableError: std::error::Error {
    /// Snake case label, e.g. `config_invalid_peerconfig`.
    fn metric_label(&self) -> String;
}
