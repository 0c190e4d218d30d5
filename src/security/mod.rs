//! Capability permissions for routed calls

pub mod permission;

pub use permission::{
    PermissionSet, SEGMENT_SEPARATOR, WILDCARD, build_a2a_permission, build_mcp_permission,
    build_permission, grant_matches, has_permission, is_valid_grant,
};
