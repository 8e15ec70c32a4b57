use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const ANNOTATION_INJECT: &str = "sqlbee.connctd.io.inject";
pub const ANNOTATION_IMAGE: &str = "sqlbee.connctd.io.image";
pub const ANNOTATION_INSTANCE: &str = "sqlbee.connctd.io.instance";
pub const ANNOTATION_SECRET: &str = "sqlbee.connctd.io.secret";
pub const ANNOTATION_CA_MAP: &str = "sqlbee.connctd.io.caMap";

/// Returns the annotation value for `key`, or `default` when the annotation
/// is not set.
pub fn resolve_string(meta: &ObjectMeta, key: &str, default: &str) -> String {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map_or_else(|| default.to_string(), Clone::clone)
}

/// Exact literal comparison, `"True"` does not match `"true"`.
pub fn has_annotation_value(meta: &ObjectMeta, key: &str, expected: &str) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .is_some_and(|v| v == expected)
}
