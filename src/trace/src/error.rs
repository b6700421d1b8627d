pub trait TraceableError: std::error::Error {
    // Used as the `error` label of failure metrics.
    fn metric_label(&self) -> String;
}
