#![cfg(unix)]

use rneter_transport::error::TransportError;
use rneter_transport::transport::{
    AnyTransport, BaseTransportArgs, SystemTransport, SystemTransportArgs, Transport,
    TransportArgs, new_transport,
};
use std::time::Duration;

fn lab_base() -> BaseTransportArgs {
    let base = BaseTransportArgs {
        auth_username: "admin".to_string(),
        ..BaseTransportArgs::new("10.0.0.1", 22)
    };
    base.timeout_transport.set(Duration::from_secs(5));
    base
}

fn insecure() -> SystemTransportArgs {
    SystemTransportArgs {
        auth_strict_key: false,
        ..Default::default()
    }
}

/// `echo` stands in for `ssh`: it prints its arguments and exits.
fn echo_transport() -> SystemTransport {
    SystemTransport::new(lab_base(), insecure()).with_exec_cmd("echo")
}

/// Wrapper that ignores the ssh arguments and echoes stdin back, like a
/// device that is slow to print its banner.
fn cat_script(name: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::temp_dir().join(format!(
        "rneter-transport-{name}-{}.sh",
        std::process::id()
    ));
    std::fs::write(&path, "#!/bin/sh\nexec cat\n").expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make script executable");
    path
}

async fn drain(transport: &mut SystemTransport) -> (String, TransportError) {
    let mut output = Vec::new();
    loop {
        match transport.read().await {
            Ok(chunk) => output.extend_from_slice(&chunk),
            Err(err) => return (String::from_utf8_lossy(&output).into_owned(), err),
        }
    }
}

#[tokio::test]
async fn spawned_program_receives_built_arguments() {
    let mut transport = echo_transport();
    assert!(!transport.is_alive());

    transport.open().await.expect("spawn echo");
    assert!(transport.is_alive());

    let (output, err) = drain(&mut transport).await;
    assert!(output.contains("10.0.0.1 -p 22 -o ConnectTimeout=5 -o ServerAliveInterval=5"));
    assert!(output.contains("-F /dev/null"));
    assert!(matches!(err, TransportError::TransportFailure));

    let _ = transport.close().await;
    assert!(!transport.is_alive());
}

#[tokio::test]
async fn ended_stream_is_a_transport_failure() {
    let mut transport = echo_transport();
    transport.open().await.expect("spawn echo");

    let (_, err) = drain(&mut transport).await;
    assert!(matches!(err, TransportError::TransportFailure));
    // Still a failure on later reads, never a raw end-of-stream.
    assert!(matches!(
        transport.read_n(16).await,
        Err(TransportError::TransportFailure)
    ));

    transport.close().await.ok();
}

#[tokio::test]
async fn netconf_session_appends_subsystem_tokens() {
    let mut transport = echo_transport();
    transport.open_netconf().await.expect("spawn echo");
    assert!(transport.is_alive());

    let open_cmd = transport.open_cmd().expect("built").to_vec();
    assert_eq!(&open_cmd[open_cmd.len() - 3..], &["-tt", "-s", "netconf"]);

    let (output, _) = drain(&mut transport).await;
    assert!(output.contains("-F /dev/null -tt -s netconf"));

    transport.close().await.ok();
    assert!(!transport.is_alive());
}

#[tokio::test]
async fn instances_are_single_use() {
    let mut transport = SystemTransport::new(lab_base(), insecure()).with_exec_cmd("cat");
    transport.open().await.expect("spawn cat");

    assert!(matches!(transport.open().await, Err(TransportError::AlreadyOpen)));
    assert!(transport.is_alive());

    let _ = transport.close().await;
    assert!(!transport.is_alive());
    assert!(matches!(transport.open().await, Err(TransportError::Closed)));
    assert!(matches!(transport.read().await, Err(TransportError::NotOpen)));
    assert!(matches!(transport.write(b"\n").await, Err(TransportError::NotOpen)));
}

#[tokio::test]
async fn spawn_failure_leaves_transport_closed() {
    let mut transport = SystemTransport::new(lab_base(), insecure())
        .with_exec_cmd("/nonexistent/rneter-transport-ssh");

    assert!(transport.open().await.is_err());
    assert!(!transport.is_alive());
}

#[tokio::test]
async fn short_read_n_keeps_the_rest_for_later() {
    let mut transport = echo_transport();
    transport.open().await.expect("spawn echo");

    let first = transport.read_n(4).await.expect("first bytes");
    assert_eq!(first, b"10.0".to_vec());

    let (rest, _) = drain(&mut transport).await;
    assert!(rest.starts_with(".0.1 -p 22"));

    transport.close().await.ok();
}

#[tokio::test]
async fn selected_transport_drives_the_same_session() {
    let args = TransportArgs {
        base: lab_base(),
        system: insecure(),
        ..Default::default()
    };
    let mut transport = match new_transport("system", args).expect("system transport") {
        AnyTransport::System(system) => AnyTransport::System(system.with_exec_cmd("echo")),
        other => other,
    };

    transport.open().await.expect("spawn echo");
    assert!(transport.is_alive());
    let chunk = transport.read().await.expect("output");
    assert!(!chunk.is_empty());

    let line = transport.format_log_message(log::Level::Debug, "opened");
    assert_eq!(line, "level=debug host=10.0.0.1 port=22 message=opened");

    let _ = transport.close().await;
    assert!(!transport.is_alive());
}

#[tokio::test]
async fn session_is_usable_after_a_read_timeout() {
    let script = cat_script("timeout-then-echo");
    let base = lab_base();
    let idle = base.timeout_transport.clone();
    let mut transport = SystemTransport::new(base, insecure())
        .with_exec_cmd(script.to_string_lossy().into_owned());
    transport.open().await.expect("spawn cat");

    idle.set(Duration::from_millis(50));
    assert!(matches!(
        transport.read_n(64).await,
        Err(TransportError::TransportTimeout)
    ));
    assert!(transport.is_alive());

    transport.write(b"show version\n").await.expect("write");

    idle.set(Duration::from_secs(2));
    let mut output = String::new();
    while !output.contains("show version") {
        let chunk = transport.read_n(64).await.expect("echoed bytes");
        output.push_str(&String::from_utf8_lossy(&chunk));
    }

    let _ = transport.close().await;
    std::fs::remove_file(&script).ok();
}
