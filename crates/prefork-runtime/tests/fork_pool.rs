//! Supervisor against real forked workers, `waitpid` and the report pipe.
//!
//! Forks real processes, so this file holds a single test and runs in its
//! own binary.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use prefork_core::{ProcessId, Termination};
use prefork_runtime::{
    report, ChildReaper, ExitEvent, ForkSpawner, ProcessMutex, Reap, ReapOutcome, SharedListener,
    Shutdown, Supervisor, WaitMode, WorkerContext, WorkerSettings,
};

fn fetch(addr: SocketAddr) -> String {
    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reply = String::new();
    client.read_to_string(&mut reply).unwrap();
    reply
}

fn next_exit<S, R>(supervisor: &mut Supervisor<S, R>) -> ExitEvent
where
    S: prefork_runtime::Spawn,
    R: Reap,
{
    loop {
        match supervisor.reaper_mut().wait_any(WaitMode::Block).unwrap() {
            ReapOutcome::Exited(event) => return event,
            ReapOutcome::Interrupted | ReapOutcome::Pending => continue,
            ReapOutcome::NoChildren => panic!("no children to wait for"),
        }
    }
}

#[test]
fn test_recycled_worker_is_replaced() {
    let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let addr = listener.local_addr();
    let mutex = ProcessMutex::create_anonymous().unwrap();
    let (receiver, sender) = report::channel().unwrap();
    let shutdown = Shutdown::new();
    let handler = |mut conn: TcpStream, pid: ProcessId| -> io::Result<()> {
        write!(conn, "worker {pid}")
    };

    let ctx = WorkerContext {
        listener: listener.handle(),
        mutex: Some(&mutex),
        reporter: Some(&sender),
        settings: WorkerSettings {
            accept_poll_interval: Duration::from_millis(50),
            max_connections: 1,
        },
    };
    let mut supervisor = Supervisor::new(
        ForkSpawner::new(ctx, &handler, shutdown.clone()),
        ChildReaper::new(receiver),
        1,
        Duration::from_secs(2),
    );

    assert_eq!(supervisor.spawn_initial(), 1);
    let first = supervisor.workers().pids()[0];
    assert_eq!(fetch(addr), format!("worker {first}"));

    // One connection served, so the worker recycles and asks for one
    // replacement over the pipe.
    let event = next_exit(&mut supervisor);
    assert_eq!(event.pid, first);
    assert_eq!(event.termination, Termination::Exited(0));
    assert_eq!(event.report, Some(1));

    assert_eq!(supervisor.handle_exit(event), 1);
    assert_eq!(supervisor.workers().len(), 1);
    let second = supervisor.workers().pids()[0];
    assert_ne!(second, first);
    assert_eq!(fetch(addr), format!("worker {second}"));

    let event = next_exit(&mut supervisor);
    assert_eq!(event.pid, second);
    assert_eq!(event.report, Some(1));
    assert_eq!(supervisor.handle_exit(event), 1);

    // The third worker idles until the drain stops it.
    shutdown.request();
    let stats = supervisor.run(&shutdown).unwrap();
    assert!(supervisor.workers().is_empty());
    assert_eq!(stats.spawned, 3);
    assert_eq!(stats.reaped, 3);
}
