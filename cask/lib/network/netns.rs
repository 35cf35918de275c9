use std::fs::File;

use futures::future::BoxFuture;
use nix::{
    sched::{setns, CloneFlags},
    unistd::Pid,
};
use rtnetlink::Handle;

use crate::{CaskError, CaskResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs a netlink closure inside another process's network namespace.
///
/// `setns` is thread-global state, so the work happens on a dedicated,
/// short-lived thread: it joins `/proc/<pid>/ns/net`, drives a current-thread
/// runtime with a fresh netlink connection, and exits. The calling thread —
/// and every pooled runtime thread — stays in its own namespace.
pub fn run_in_netns<T, F>(pid: Pid, f: F) -> CaskResult<T>
where
    T: Send + 'static,
    F: FnOnce(Handle) -> BoxFuture<'static, CaskResult<T>> + Send + 'static,
{
    let thread = std::thread::Builder::new()
        .name("cask-netns".into())
        .spawn(move || -> CaskResult<T> {
            let ns_file = File::open(format!("/proc/{}/ns/net", pid))?;
            setns(&ns_file, CloneFlags::CLONE_NEWNET)?;

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()?;

            runtime.block_on(async move {
                let (connection, handle, _) = rtnetlink::new_connection()?;
                tokio::spawn(connection);
                f(handle).await
            })
        })?;

    thread.join().map_err(|_| {
        CaskError::Network("network namespace configuration thread panicked".into())
    })?
}
