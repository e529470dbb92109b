//! Build metadata embedded by the build script.

/// Short commit hash at build time, or `unknown` outside a checkout.
pub const GIT_HASH: &str = env!("CTXPACK_GIT_HASH");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("CTXPACK_BUILD_PROFILE");

/// Engine version. Part of every cache key, so upgrades never serve stale layouts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version with commit and profile, e.g. `"0.1.0 (abc1234, release)"`.
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}
