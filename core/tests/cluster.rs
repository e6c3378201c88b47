//! Copyright (c) 2024-2025 Prefork Contributors
//!
//! This file is part of Prefork
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU Affero General Public License for more details.
//!
//! You should have received a copy of the GNU Affero General Public License
//! along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! end to end cluster scenarios
//!
//! runs without the libtest harness: the binary doubles as the worker
//! program, selected by the PREFORK_WORKER_MODE environment variable
//! the parent sets before spawning the pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use prefork_core::{Strategy, Supervisor, SupervisorConfig, SupervisorError, Worker};

fn main() {
    if let Ok(mode) = std::env::var("PREFORK_WORKER_MODE") {
        worker_main(&mode);
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    run("misuse_preconditions", misuse_preconditions);
    run("pool_start_and_broadcast", pool_start_and_broadcast);
    run("crash_respawn", crash_respawn);
    run("graceful_stop_within_deadline", graceful_stop_within_deadline);
    run("stop_escalates_to_kill", stop_escalates_to_kill);
    run("rolling_restart", rolling_restart);
    run("fd_passing_round_trip", fd_passing_round_trip);
    println!("all cluster scenarios passed");
}

fn run(name: &str, scenario: fn()) {
    println!("scenario {name} ...");
    scenario();
    println!("scenario {name} ok");
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn test_config(mode: &str, tag: &str) -> SupervisorConfig {
    std::env::set_var("PREFORK_WORKER_MODE", mode);
    let exe = std::env::current_exe()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    SupervisorConfig::new(vec![exe]).with_ipc_socket_path(
        std::env::temp_dir().join(format!("prefork-e2e-{tag}-{}.sock", std::process::id())),
    )
}

async fn wait_for_ready(supervisor: &Supervisor, count: usize) {
    for _ in 0..400 {
        if supervisor.ready_count().await >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("pool never reached {count} ready workers");
}

// ---- scenarios ----

fn misuse_preconditions() {
    runtime().block_on(async {
        let supervisor = Supervisor::new(test_config("echo", "misuse")).unwrap();

        assert!(matches!(
            supervisor.start(0).await,
            Err(SupervisorError::Misuse(_))
        ));

        supervisor.start(1).await.unwrap();
        assert!(matches!(
            supervisor.start(1).await,
            Err(SupervisorError::Misuse(_))
        ));

        supervisor.stop().await.unwrap();
        // stop is idempotent
        supervisor.stop().await.unwrap();
        assert!(supervisor.wait().await.is_ok());
    });
}

fn pool_start_and_broadcast() {
    runtime().block_on(async {
        let supervisor = Supervisor::new(test_config("echo", "pool")).unwrap();

        let pongs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pongs);
        supervisor.on_message("pong", move |worker_id, _payload| {
            sink.lock().unwrap().push(worker_id);
        });

        supervisor.start(3).await.unwrap();
        let pids = supervisor.worker_pids().await;
        assert_eq!(pids.len(), 3);
        let mut unique = pids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3, "worker pids must be distinct");

        wait_for_ready(&supervisor, 3).await;
        supervisor.broadcast("ping", json!("ping")).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if pongs.lock().unwrap().len() >= 3 {
                break;
            }
            assert!(Instant::now() < deadline, "pongs never arrived");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        supervisor.stop().await.unwrap();
        assert!(supervisor.wait().await.is_ok());
        assert!(supervisor.worker_pids().await.is_empty());
    });
}

fn crash_respawn() {
    runtime().block_on(async {
        let supervisor = Supervisor::new(test_config("echo", "crash")).unwrap();
        supervisor.start(2).await.unwrap();
        wait_for_ready(&supervisor, 2).await;

        let pids = supervisor.worker_pids().await;
        let (victim, survivor) = (pids[0], pids[1]);
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(victim as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let now = supervisor.worker_pids().await;
            if now.len() == 2 && !now.contains(&victim) && now.contains(&survivor) {
                break;
            }
            assert!(Instant::now() < deadline, "pool never refilled after kill");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        supervisor.stop().await.unwrap();
    });
}

fn graceful_stop_within_deadline() {
    runtime().block_on(async {
        let supervisor = Supervisor::new(test_config("echo", "graceful")).unwrap();
        supervisor.start(2).await.unwrap();
        wait_for_ready(&supervisor, 2).await;

        // cooperative workers exit on request, no kill is needed and
        // stop reports no timeout
        supervisor.stop().await.unwrap();
        assert!(supervisor.wait().await.is_ok());
    });
}

fn stop_escalates_to_kill() {
    runtime().block_on(async {
        let config = test_config("stubborn", "stubborn").with_timeout(Duration::from_secs(1));
        let supervisor = Supervisor::new(config).unwrap();
        supervisor.start(1).await.unwrap();
        wait_for_ready(&supervisor, 1).await;

        let begun = Instant::now();
        match supervisor.stop().await {
            Err(SupervisorError::StopFailed { failures }) => {
                assert!(failures
                    .iter()
                    .any(|f| matches!(f, SupervisorError::Timeout { .. })));
            }
            other => panic!("expected StopFailed with a timeout, got {other:?}"),
        }
        // deadline plus a margin for the kill itself
        assert!(begun.elapsed() < Duration::from_secs(5));
    });
}

fn rolling_restart() {
    runtime().block_on(async {
        let supervisor = Supervisor::new(test_config("echo", "roll")).unwrap();
        supervisor.start(4).await.unwrap();
        wait_for_ready(&supervisor, 4).await;

        let before = supervisor.worker_pids().await;

        // capacity sampler, the pool must never drop below N-1
        let min_seen = Arc::new(AtomicUsize::new(4));
        let sampling = Arc::new(AtomicBool::new(true));
        let sampler = {
            let supervisor = supervisor.clone();
            let min_seen = Arc::clone(&min_seen);
            let sampling = Arc::clone(&sampling);
            tokio::spawn(async move {
                while sampling.load(Ordering::SeqCst) {
                    let live = supervisor.worker_pids().await.len();
                    min_seen.fetch_min(live, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        supervisor.restart().await.unwrap();
        sampling.store(false, Ordering::SeqCst);
        sampler.await.unwrap();

        assert!(
            min_seen.load(Ordering::SeqCst) >= 3,
            "capacity dropped below N-1 during the rolling restart"
        );

        let after = supervisor.worker_pids().await;
        assert_eq!(after.len(), 4);
        for pid in &after {
            assert!(!before.contains(pid), "pid {pid} survived the restart");
        }

        supervisor.stop().await.unwrap();
    });
}

fn fd_passing_round_trip() {
    runtime().block_on(async {
        let config = test_config("fd", "fdpass").with_strategy(Strategy::FdPassing);
        let supervisor = Supervisor::new(config).unwrap();

        let address = Arc::new(Mutex::new(None::<String>));
        let sink = Arc::clone(&address);
        supervisor.on_message("listening", move |_worker_id, payload| {
            if let Some(addr) = payload.as_str() {
                *sink.lock().unwrap() = Some(addr.to_string());
            }
        });

        supervisor.start(1).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let bound = loop {
            if let Some(addr) = address.lock().unwrap().clone() {
                break addr;
            }
            assert!(Instant::now() < deadline, "worker never reported its listener");
            tokio::time::sleep(Duration::from_millis(25)).await;
        };

        // the parent bound the socket, the worker accepts on the passed fd
        use tokio::io::AsyncReadExt;
        let mut conn = tokio::net::TcpStream::connect(&bound).await.unwrap();
        let mut greeting = Vec::new();
        conn.read_to_end(&mut greeting).await.unwrap();
        assert_eq!(greeting, b"hello");

        supervisor.stop().await.unwrap();
    });
}

// ---- worker side ----

fn worker_main(mode: &str) {
    let socket = std::env::args().nth(1).expect("socket path argument");
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async move {
        let worker = Worker::connect(&socket).await.expect("connect to parent");

        // attaching as a worker forbids supervisor construction here
        assert!(matches!(
            Supervisor::new(SupervisorConfig::new(vec!["true"])),
            Err(SupervisorError::Misuse(_))
        ));

        match mode {
            "echo" => {
                let me = worker.clone();
                worker.on_message("ping", move |payload| {
                    let me = me.clone();
                    tokio::spawn(async move {
                        let _ = me.send("pong", payload).await;
                    });
                });
                worker.ready().await.expect("ready");
                worker.await_shutdown().await;
                let _ = worker.notify_terminated().await;
            }
            "stubborn" => {
                worker.ready().await.expect("ready");
                // ignores shutdown until the parent loses patience
                std::future::pending::<()>().await;
            }
            "fd" => {
                let listener = worker
                    .get_listener("tcp://127.0.0.1:0")
                    .await
                    .expect("listener from parent");
                let bound = listener.tcp_local_addr().expect("tcp address");
                worker
                    .send("listening", json!(bound.to_string()))
                    .await
                    .expect("report address");
                worker.ready().await.expect("ready");
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            if let Ok(mut stream) = accepted {
                                use tokio::io::AsyncWriteExt;
                                let _ = stream.write_all(b"hello").await;
                                let _ = stream.shutdown().await;
                            }
                        }
                        _ = worker.await_shutdown() => {
                            let _ = worker.notify_terminated().await;
                            break;
                        }
                    }
                }
            }
            other => panic!("unknown worker mode '{other}'"),
        }
    });
}
