//! Annotation keys written by the controller.

pub const ANNOTATION_MANAGED_BY: &str = "nightjar.io/managed-by";
pub const ANNOTATION_CONSTRAINT_TYPE: &str = "nightjar.io/constraint-type";
pub const ANNOTATION_CONSTRAINT_NAME: &str = "nightjar.io/constraint-name";
pub const ANNOTATION_SEVERITY: &str = "nightjar.io/severity";
pub const ANNOTATION_SOURCE_KIND: &str = "nightjar.io/source-kind";
pub const ANNOTATION_CONSTRAINTS: &str = "nightjar.io/constraints";

pub const MANAGED_BY_VALUE: &str = "nightjar";
