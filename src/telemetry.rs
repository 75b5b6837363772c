#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_kind(name: &'static str, kind: crate::types::ResourceKind) {
    metrics::increment_counter!(name, "resource_type" => kind.as_str());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_kind(_name: &'static str, _kind: crate::types::ResourceKind) {}
