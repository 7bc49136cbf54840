//! Process-level watcher tests that want a quiet process: child reaping
//! and signal delivery share one self-pipe per process.
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use flux_fabric::reactor::{Reactor, RunFlags};
use flux_fabric::Watcher;

#[test]
fn test_child_watcher_reports_exit_status() {
    let r = Reactor::new().unwrap();

    // The handler must be in place before the child can exit, or the
    // SIGCHLD edge is lost.
    flux_signals::install(&[flux_signals::Signal::Child]).unwrap();

    let child = std::process::Command::new("/bin/sh")
        .args(["-c", "exit 7"])
        .spawn()
        .expect("spawn child");
    let pid = child.id() as i32;

    let status = Rc::new(Cell::new(None));
    let w = Watcher::child(&r, pid, {
        let status = status.clone();
        move |r, w, _| {
            let (rpid, rstatus) = w.child_status().unwrap();
            status.set(Some((rpid, rstatus)));
            w.stop();
            r.stop();
        }
    });
    w.start();

    // Belt and braces: a timeout so a lost SIGCHLD fails the test instead
    // of hanging it.
    let timeout = Watcher::timer(&r, Duration::from_secs(5), Duration::ZERO, |r, _, _| {
        r.stop_error(flux_fabric::Errno::ETIMEDOUT)
    });
    timeout.start();

    r.run(RunFlags::Default).expect("child watcher fired");

    let (rpid, rstatus) = status.get().expect("status reported");
    assert_eq!(rpid, pid);
    assert!(libc::WIFEXITED(rstatus));
    assert_eq!(libc::WEXITSTATUS(rstatus), 7);
}
