use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Shutdown flag shared with the repository. Set on first SIGINT/SIGTERM.
static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Install signal handlers for cooperative shutdown and return the flag
/// they set.
///
/// First signal sets the flag and restores the default handler so a
/// second signal terminates immediately.
pub(crate) fn install_signal_handlers() -> Arc<AtomicBool> {
    let flag = SHUTDOWN
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone();

    #[cfg(unix)]
    {
        // Safety: the handler only sets an atomic bool and restores the default handler.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }

    flag
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::SeqCst);
    }
    // Restore default handler so a second signal kills immediately
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_returns_the_shared_flag() {
        let a = install_signal_handlers();
        let b = install_signal_handlers();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.load(Ordering::SeqCst));
    }
}
