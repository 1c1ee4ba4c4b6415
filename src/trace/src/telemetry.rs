use opentelemetry::trace::TraceId;
use rand::Rng;

/// Generate a random trace id used to correlate all log lines of a single reconcile pass.
pub fn get_trace_id() -> TraceId {
    let mut rng = rand::thread_rng();
    let val: u128 = rng.gen();
    TraceId::from(val)
}

#[cfg(test)]
mod tests {
    use super::get_trace_id;

    #[test]
    fn trace_ids_are_not_repeated() {
        let a = get_trace_id();
        let b = get_trace_id();
        assert_ne!(a, b);
    }
}
