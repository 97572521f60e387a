//! End-to-end session tests.
//!
//! The `real_pty` module spawns `/bin/sh` and only runs on Unix. Everything
//! else goes through the in-memory PTY.

mod common;

use common::{collect_until_exit, fake_manager, TestEnv, DEFAULT_TIMEOUT};
use pretty_assertions::assert_eq as pretty_eq;
use std::time::Duration;
use terminal::{load_history, CommandHistorySink, CreateOptions, KillOptions, TerminalManager};

// ============================================================================
// History and Spool Wiring
// ============================================================================

mod persistence {
    use super::*;

    #[test]
    fn commands_land_in_jsonl_history() {
        let env = TestEnv::new();
        let history = env.open_history();
        let spawner = terminal::test_support::FakePtySpawner::new();
        let manager = TerminalManager::new(Default::default())
            .with_spawner(std::sync::Arc::new(spawner.clone()))
            .with_history(history.clone());

        manager
            .create_or_attach(
                "pane-1",
                CreateOptions {
                    workspace_id: Some("ws".into()),
                    ..CreateOptions::default()
                },
            )
            .expect("spawn should succeed");
        let pty = spawner.last().expect("spawned");
        pty.emit("\x1b]133;C;git status\x07clean\r\n\x1b]133;D;0\x07");
        pty.emit("\x1b]133;C;false\x07\x1b]133;D;1\x07");
        assert!(history.flush(Duration::from_secs(5)));

        let entries = load_history(&env.history_path).expect("should load");
        let summary: Vec<(String, Option<i32>)> = entries
            .iter()
            .map(|entry| (entry.command.clone(), entry.exit_code))
            .collect();
        pretty_eq!(
            summary,
            vec![("git status".to_string(), Some(0)), ("false".to_string(), Some(1))]
        );
        assert!(entries
            .iter()
            .all(|entry| entry.session_id == "pane-1" && entry.workspace_id.as_deref() == Some("ws")));
    }

    #[test]
    fn kill_with_delete_history_clears_both_stores() {
        let env = TestEnv::new();
        let history = env.open_history();
        let spool = env.open_spool();
        let spawner = terminal::test_support::FakePtySpawner::new();
        let manager = TerminalManager::new(Default::default())
            .with_spawner(std::sync::Arc::new(spawner.clone()))
            .with_history(history.clone())
            .with_spool(spool.clone());

        for id in ["keep", "drop"] {
            manager
                .create_or_attach(id, CreateOptions::default())
                .expect("spawn should succeed");
            let pty = spawner.for_session(id).expect("spawned");
            pty.emit(&format!("\x1b]133;C;echo {id}\x07{id}\r\n\x1b]133;D;0\x07"));
        }

        assert!(manager.kill(
            "drop",
            KillOptions {
                delete_history: true
            }
        ));
        assert!(history.flush(Duration::from_secs(5)));

        let commands: Vec<String> = load_history(&env.history_path)
            .expect("should load")
            .into_iter()
            .map(|entry| entry.command)
            .collect();
        pretty_eq!(commands, vec!["echo keep".to_string()]);
        assert_eq!(manager.persisted_history("drop"), None);
        assert_eq!(manager.persisted_history("keep").as_deref(), Some("keep\r\n"));
    }

    #[test]
    fn noop_sink_accepts_everything() {
        let sink = terminal::NoopHistorySink;
        sink.delete_session_history("anything");
        let (manager, spawner) = fake_manager();
        manager
            .create_or_attach("pane", CreateOptions::default())
            .expect("spawn should succeed");
        spawner
            .last()
            .expect("spawned")
            .emit("\x1b]133;C;ls\x07\x1b]133;D;0\x07");
        assert_eq!(manager.get_history("pane").as_deref(), Some(""));
    }
}

// ============================================================================
// Real PTY
// ============================================================================

#[cfg(unix)]
mod real_pty {
    use super::*;
    use common::{sh_manager, wait_until};
    use terminal::SessionStatus;

    fn have_sh() -> bool {
        std::path::Path::new("/bin/sh").exists()
    }

    #[test]
    fn echo_and_exit_code_reach_subscriber() {
        if !have_sh() {
            return;
        }
        let env = TestEnv::new();
        let manager = sh_manager();
        let mut subscription = manager.subscribe("smoke-1");

        let result = manager
            .create_or_attach(
                "smoke-1",
                CreateOptions {
                    cwd: Some(env.temp_dir.path().to_path_buf()),
                    initial_commands: vec!["echo pane=$TERMHOST_PANE_ID".into(), "exit 3".into()],
                    ..CreateOptions::default()
                },
            )
            .expect("should spawn /bin/sh");
        assert!(result.is_new);

        let transcript = collect_until_exit(&mut subscription, DEFAULT_TIMEOUT);
        assert!(
            transcript.output.contains("pane=smoke-1"),
            "output was {:?}",
            transcript.output
        );
        assert_eq!(transcript.exit.map(|(code, _)| code), Some(3));

        let info = manager.get_session("smoke-1").expect("exited sessions stay queryable");
        assert!(!info.status.is_alive());
        assert!(!manager.write("smoke-1", b"ignored\n"));
    }

    #[test]
    fn signal_death_is_reported_in_exit_event() {
        if !have_sh() {
            return;
        }
        let manager = sh_manager();
        let mut subscription = manager.subscribe("smoke-4");
        manager
            .create_or_attach("smoke-4", CreateOptions::default())
            .expect("should spawn /bin/sh");
        assert!(manager.write("smoke-4", b"kill -9 $$\n"));

        let transcript = collect_until_exit(&mut subscription, DEFAULT_TIMEOUT);
        let (exit_code, signal) = transcript.exit.expect("shell should exit");
        assert_ne!(exit_code, 0);
        assert!(signal.is_some(), "expected a signal, got exit code {}", exit_code);

        let info = manager.get_session("smoke-4").expect("exited sessions stay queryable");
        match info.status {
            SessionStatus::Exited { signal, .. } => assert!(signal.is_some()),
            other => panic!("expected Exited, got {:?}", other),
        }
    }

    #[test]
    fn kill_terminates_a_running_shell() {
        if !have_sh() {
            return;
        }
        let manager = sh_manager();
        let mut subscription = manager.subscribe("smoke-2");
        manager
            .create_or_attach("smoke-2", CreateOptions::default())
            .expect("should spawn /bin/sh");
        assert!(manager.write("smoke-2", b"echo alive\n"));
        assert!(wait_until(DEFAULT_TIMEOUT, || manager
            .get_history("smoke-2")
            .is_some_and(|history| history.contains("alive\r\n"))));

        assert!(manager.kill("smoke-2", KillOptions::default()));
        assert_eq!(manager.get_session("smoke-2"), None);

        // A killed session reports nothing further, not even its exit.
        let transcript = collect_until_exit(&mut subscription, Duration::from_millis(300));
        assert_eq!(transcript.exit, None);
    }

    #[test]
    fn resize_and_signal_reach_the_pty() {
        if !have_sh() {
            return;
        }
        let manager = sh_manager();
        manager
            .create_or_attach("smoke-3", CreateOptions::default())
            .expect("should spawn /bin/sh");

        assert!(manager.resize("smoke-3", 100, 40, Some(1)));
        let info = manager.get_session("smoke-3").expect("exists");
        assert_eq!((info.size.cols, info.size.rows), (100, 40));
        assert!(info.pid.is_some());

        assert!(manager.signal("smoke-3", Some("WINCH")));
        assert!(!manager.signal("smoke-3", Some("NOT_A_SIGNAL")));
        assert!(manager.kill("smoke-3", KillOptions::default()));
    }
}
