//! CPU affinity utilities for binding threads to specific cores.
//!
//! The feed normalizer runs on a dedicated blocking thread; pinning it keeps
//! tick latency steady under load. Wraps the `core_affinity` crate.

use tracing::{info, warn};

/// Bind the current thread to the specified CPU core.
///
/// Returns `true` if the binding succeeded, `false` if the core ID is invalid
/// or the OS rejected the request.
pub fn bind_to_core(core_id: usize) -> bool {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    match core_ids.get(core_id) {
        Some(core) => {
            let ok = core_affinity::set_for_current(*core);
            if ok {
                info!("[affinity] bound thread to CPU core {core_id}");
            } else {
                warn!("[affinity] failed to bind thread to CPU core {core_id}");
            }
            ok
        }
        None => {
            warn!(
                "[affinity] CPU core {core_id} not available (system has {} cores)",
                core_ids.len()
            );
            false
        }
    }
}

/// Bind the current thread if `core_id` is a non-negative `Some`.
pub fn maybe_bind(core_id: Option<i32>) -> bool {
    match core_id {
        Some(id) if id >= 0 => bind_to_core(id as usize),
        _ => false,
    }
}
