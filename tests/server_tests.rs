mod support;

use mongo_runner::Error;
use mongo_runner::client::Probe;
use mongo_runner::context::{ConfirmPolicy, ExecutionContext};
use mongo_runner::model::{OptionValue, Server};
use mongo_runner::repository::InMemoryRepository;
use mongo_runner::server::{ServerState, StartOptions, StartOutcome, StopOptions, StopOutcome, StopSignal};
use support::{Harness, bring_online};

fn repository_with(server: &Server) -> InMemoryRepository {
    InMemoryRepository::new().with_server(server.clone())
}

#[tokio::test]
async fn test_start_spawns_and_waits_until_online() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let outcome = runner
        .start_server("alpha", &StartOptions::default())
        .await
        .unwrap();

    let world = harness.world.lock().unwrap();
    assert_eq!(world.spawned.len(), 1);
    let command = &world.spawned[0];
    assert!(command.detached);
    assert!(command.program.ends_with("bin/mongod"));
    assert!(!command.args.iter().any(|a| a == "--fork"));
    assert!(command.args.windows(2).any(|w| w[0] == "--port" && w[1] == "28017"));
    assert!(command.args.iter().any(|a| a == "--logpath"));

    let pid = world.pids.get("alpha").copied();
    assert_eq!(outcome, StartOutcome::Started { pid });
    assert!(server.options.dbpath.as_ref().unwrap().is_dir());
    assert_eq!(harness.provisioner.calls.lock().unwrap().as_slice(), ["alpha"]);
}

#[tokio::test]
async fn test_start_is_noop_when_already_running() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    bring_online(&harness.world, &server);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let outcome = runner
        .start_server("alpha", &StartOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, StartOutcome::AlreadyRunning);
    assert!(harness.world.lock().unwrap().spawned.is_empty());
}

#[tokio::test]
async fn test_second_start_does_not_spawn_again() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let first = runner
        .start_server("alpha", &StartOptions::default())
        .await
        .unwrap();
    let second = runner
        .start_server("alpha", &StartOptions::default())
        .await
        .unwrap();

    assert!(matches!(first, StartOutcome::Started { .. }));
    assert_eq!(second, StartOutcome::AlreadyRunning);
    assert_eq!(harness.world.lock().unwrap().spawned.len(), 1);
}

#[tokio::test]
async fn test_start_refuses_unresponsive_port() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    harness
        .world
        .lock()
        .unwrap()
        .probes
        .insert("alpha".to_string(), Probe::TimedOut);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let result = runner.start_server("alpha", &StartOptions::default()).await;

    match result {
        Err(Error::Lifecycle { message, .. }) => assert!(message.contains("timed out")),
        other => panic!("Expected lifecycle error, got {:?}", other),
    }
    assert!(harness.world.lock().unwrap().spawned.is_empty());
}

#[tokio::test]
async fn test_start_reports_log_file_when_process_exits() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    harness.world.lock().unwrap().exit_on_spawn = true;
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let error = runner
        .start_server("alpha", &StartOptions::default())
        .await
        .unwrap_err();

    let log_file = server.log_file_path().unwrap();
    let message = error.to_string();
    assert!(message.contains("Could not start the server"));
    assert!(message.contains(&log_file.display().to_string()));
}

#[tokio::test]
async fn test_start_rejects_remote_server() {
    let harness = Harness::new();
    let mut server = harness.server("alpha", 28017);
    server.address = Some("db-remote.invalid:28017".to_string());
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let result = runner.start_server("alpha", &StartOptions::default()).await;

    assert!(matches!(result, Err(Error::Locality(_))));
    assert!(harness.world.lock().unwrap().spawned.is_empty());
}

#[tokio::test]
async fn test_start_remote_server_assumed_local() {
    let harness = Harness::new();
    let mut server = harness.server("alpha", 28017);
    server.address = Some("db-remote.invalid:28017".to_string());
    let context = ExecutionContext::new()
        .with_confirm(ConfirmPolicy::AcceptAll)
        .assume_local("alpha");
    let runner = harness.runner_with_context(repository_with(&server), context);

    let outcome = runner
        .start_server("alpha", &StartOptions::default())
        .await
        .unwrap();

    assert!(matches!(outcome, StartOutcome::Started { .. }));
}

#[tokio::test]
async fn test_start_without_dbpath_is_configuration_error() {
    let harness = Harness::new();
    let mut server = harness.server("alpha", 28017);
    server.options.dbpath = None;
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let result = runner.start_server("alpha", &StartOptions::default()).await;

    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn test_start_in_foreground() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);
    let mut options = StartOptions::default();
    options
        .overrides
        .insert("fork".to_string(), OptionValue::Bool(false));

    let outcome = runner.start_server("alpha", &options).await.unwrap();

    assert!(matches!(outcome, StartOutcome::Started { .. }));
    let world = harness.world.lock().unwrap();
    let command = &world.spawned[0];
    assert!(!command.detached);
    assert!(!command.args.iter().any(|a| a == "--logpath" || a == "--fork"));
    assert!(command.args.iter().any(|a| a == "--pidfilepath"));
}

#[tokio::test]
async fn test_failed_preparation_kills_server() {
    let harness = Harness::with_provisioner(support::CountingProvisioner {
        fail: true,
        ..Default::default()
    });
    let server = harness.server("alpha", 28017);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let result = runner.start_server("alpha", &StartOptions::default()).await;

    assert!(matches!(result, Err(Error::Lifecycle { source: Some(_), .. })));
    assert_eq!(harness.world.lock().unwrap().terminated, 1);
}

#[tokio::test]
async fn test_failed_preparation_kept_when_declined() {
    let harness = Harness::with_provisioner(support::CountingProvisioner {
        fail: true,
        ..Default::default()
    });
    let server = harness.server("alpha", 28017);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::DeclineAll);

    let outcome = runner
        .start_server("alpha", &StartOptions::default())
        .await
        .unwrap();

    assert!(matches!(outcome, StartOutcome::Started { .. }));
    assert_eq!(harness.world.lock().unwrap().terminated, 0);
}

#[tokio::test]
async fn test_failed_preparation_kept_when_unattended() {
    let harness = Harness::with_provisioner(support::CountingProvisioner {
        fail: true,
        ..Default::default()
    });
    let server = harness.server("alpha", 28017);
    let context = ExecutionContext::non_interactive().with_confirm(ConfirmPolicy::AcceptAll);
    let runner = harness.runner_with_context(repository_with(&server), context);

    let outcome = runner
        .start_server("alpha", &StartOptions::default())
        .await
        .unwrap();

    assert!(matches!(outcome, StartOutcome::Started { .. }));
    assert_eq!(harness.world.lock().unwrap().terminated, 0);
}

#[tokio::test]
async fn test_status_reports_state_and_pid() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let status = runner.server_status("alpha").await.unwrap();
    assert_eq!(status.state, ServerState::Offline);
    assert_eq!(status.pid, None);
    assert_eq!(status.address, "127.0.0.1:28017");

    let pid = bring_online(&harness.world, &server);
    let status = runner.server_status("alpha").await.unwrap();
    assert_eq!(status.state, ServerState::Online);
    assert_eq!(status.pid, Some(pid));
}

#[tokio::test]
async fn test_stop_offline_server() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let outcome = runner
        .stop_server("alpha", &StopOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, StopOutcome::NotRunning);
    assert!(harness.world.lock().unwrap().commands.is_empty());
}

#[tokio::test]
async fn test_stop_gracefully() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    bring_online(&harness.world, &server);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::DeclineAll);

    let outcome = runner
        .stop_server("alpha", &StopOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, StopOutcome::Stopped);
    let world = harness.world.lock().unwrap();
    assert_eq!(world.command_names("alpha"), vec!["shutdown"]);
    assert!(world.signals.is_empty());
}

#[tokio::test]
async fn test_stop_escalates_to_signals() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    let pid = bring_online(&harness.world, &server);
    {
        let mut world = harness.world.lock().unwrap();
        world.ignore_shutdown = true;
        world.ignore_hangup = true;
    }
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::DeclineAll);
    let options = StopOptions {
        force: true,
        step_down: false,
    };

    let outcome = runner.stop_server("alpha", &options).await.unwrap();

    assert_eq!(outcome, StopOutcome::Stopped);
    let world = harness.world.lock().unwrap();
    assert_eq!(
        world.signals,
        vec![(pid, StopSignal::Hangup), (pid, StopSignal::Kill)]
    );
    let shutdowns: Vec<bool> = world
        .commands
        .iter()
        .filter_map(|(_, c)| c.contains_key("shutdown").then(|| c.get_bool("force").unwrap()))
        .collect();
    assert_eq!(shutdowns, vec![false, true]);
}

#[tokio::test]
async fn test_stop_hangup_is_enough() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    let pid = bring_online(&harness.world, &server);
    harness.world.lock().unwrap().ignore_shutdown = true;
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let outcome = runner
        .stop_server("alpha", &StopOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, StopOutcome::Stopped);
    assert_eq!(
        harness.world.lock().unwrap().signals,
        vec![(pid, StopSignal::Hangup)]
    );
}

#[tokio::test]
async fn test_stop_declined_force_sends_no_signal() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    bring_online(&harness.world, &server);
    harness.world.lock().unwrap().ignore_shutdown = true;
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::DeclineAll);

    let result = runner.stop_server("alpha", &StopOptions::default()).await;

    match result {
        Err(Error::Lifecycle { message, .. }) => assert!(message.contains("declined")),
        other => panic!("Expected lifecycle error, got {:?}", other),
    }
    assert!(harness.world.lock().unwrap().signals.is_empty());
}

#[tokio::test]
async fn test_stop_without_pid_fails() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    {
        let mut world = harness.world.lock().unwrap();
        world.probes.insert("alpha".to_string(), Probe::Reachable);
        world.ignore_shutdown = true;
    }
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let result = runner.stop_server("alpha", &StopOptions::default()).await;

    assert!(matches!(result, Err(Error::Lifecycle { .. })));
    assert!(harness.world.lock().unwrap().signals.is_empty());
}

#[tokio::test]
async fn test_stop_steps_down_primary() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    bring_online(&harness.world, &server);
    harness.world.lock().unwrap().primary = Some("alpha".to_string());
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);
    let options = StopOptions {
        force: false,
        step_down: true,
    };

    runner.stop_server("alpha", &options).await.unwrap();

    assert_eq!(
        harness.world.lock().unwrap().command_names("alpha"),
        vec!["isMaster", "replSetStepDown", "shutdown"]
    );
}

#[tokio::test]
async fn test_stop_rejects_remote_server() {
    let harness = Harness::new();
    let mut server = harness.server("alpha", 28017);
    server.address = Some("db-remote.invalid".to_string());
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let result = runner.stop_server("alpha", &StopOptions::default()).await;

    assert!(matches!(result, Err(Error::Locality(_))));
}

#[tokio::test]
async fn test_restart_stops_then_starts() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    bring_online(&harness.world, &server);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let outcome = runner
        .restart_server("alpha", &StartOptions::default())
        .await
        .unwrap();

    assert!(matches!(outcome, StartOutcome::Started { .. }));
    let world = harness.world.lock().unwrap();
    assert_eq!(world.command_names("alpha"), vec!["shutdown"]);
    assert_eq!(world.spawned.len(), 1);
}

#[tokio::test]
async fn test_dry_run_start_has_no_side_effects() {
    let harness = Harness::new();
    let server = harness.server("alpha", 28017);
    let runner = harness.runner(repository_with(&server), ConfirmPolicy::AcceptAll);

    let command = runner
        .dry_run_start("alpha", &StartOptions::default())
        .await
        .unwrap();

    assert!(command.to_string().contains("--dbpath"));
    assert!(harness.world.lock().unwrap().spawned.is_empty());
    assert!(!server.options.dbpath.as_ref().unwrap().exists());
}

#[tokio::test]
async fn test_unknown_server() {
    let harness = Harness::new();
    let runner = harness.runner(InMemoryRepository::new(), ConfirmPolicy::AcceptAll);

    let result = runner.start_server("ghost", &StartOptions::default()).await;

    assert!(matches!(result, Err(Error::ServerNotFound(id)) if id == "ghost"));
}
