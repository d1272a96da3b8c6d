mod context;
mod error;
mod inject;
mod metrics;
mod migrate;
mod report;
mod request;
mod route;
mod simulate;
mod track;
mod validate;

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use roam_core::{
    parse_target, MigrationPolicy, NetworkChangeConfig, RunConfig, Target, TriggerMode,
    DEFAULT_PORT, DEFAULT_ROUTE_POLL_MS,
};
use roam_engine::sim::{SimProfile, SimSession};
use roam_engine::Session;
use tokio::runtime::Builder;
use tracing_subscriber::EnvFilter;

use context::RunContext;
use inject::{CommandInjector, EngineResetInjector, FaultInjector};
use report::{ReportWriter, Reporter};
use request::run_client;

#[derive(Parser, Debug)]
#[command(
    name = "roam-client",
    about = "roam-client - QUIC request driver with path migration and handover measurement"
)]
struct Args {
    /// Server to contact: host, host:port or [v6]:port.
    #[arg(value_parser = parse_target_arg)]
    target: Target,
    #[arg(long = "num-requests", short = 'n', default_value_t = 1)]
    num_requests: u32,
    /// POST this body instead of issuing a GET.
    #[arg(long = "body", short = 'b')]
    body: Option<String>,
    #[arg(long = "redirect-is-success")]
    redirect_is_success: bool,
    /// Tear the connection down and reconnect between requests.
    #[arg(long = "one-connection-per-request")]
    one_connection_per_request: bool,
    /// Keep the source port fixed between requests.
    #[arg(long = "disable-port-changes")]
    disable_port_changes: bool,
    /// Treat a version-negotiation failure as success instead of exiting
    /// with its dedicated code.
    #[arg(long = "version-mismatch-ok")]
    version_mismatch_ok: bool,
    #[arg(long = "quiet", short = 'q')]
    quiet: bool,
    #[arg(
        long = "policy",
        default_value = "gateway-change",
        value_parser = parse_policy
    )]
    policy: MigrationPolicy,
    #[arg(
        long = "route-poll-ms",
        default_value_t = DEFAULT_ROUTE_POLL_MS,
        value_parser = parse_poll_ms
    )]
    route_poll_ms: u64,
    /// Initial local UDP port; 0 asks the OS for an ephemeral one.
    #[arg(long = "local-port", default_value_t = 0)]
    local_port: u16,
    /// Sample the received-sequence high-water mark in the background.
    #[arg(long = "track")]
    track: bool,
    /// Where measurement records go; "-" writes JSON lines to stdout.
    #[arg(long = "output", short = 'o', default_value = "-")]
    output: String,
    /// Number of network-change events to inject; 0 disables the schedule.
    #[arg(long = "changes", default_value_t = 0)]
    changes: u32,
    /// Time mode: jitter bound in milliseconds. Sequence mode: acked step.
    #[arg(long = "change-interval", default_value_t = 5000)]
    change_interval: u64,
    #[arg(long = "trigger", default_value = "time", value_parser = parse_trigger)]
    trigger: TriggerMode,
    #[arg(long = "start-interface", default_value = "wlan0")]
    start_interface: String,
    #[arg(long = "alternate-interface", default_value = "wlan1")]
    alternate_interface: String,
    /// External command that performs a path switch; the from and to
    /// interface names are appended as its final two arguments.
    #[arg(long = "inject-cmd", value_parser = parse_command)]
    inject_cmd: Option<InjectCommand>,
}

fn main() {
    init_logging();
    let args = Args::parse();

    let peer = match (args.target.host.as_str(), args.target.port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                tracing::error!("Target {} did not resolve", args.target);
                std::process::exit(2);
            }
        },
        Err(err) => {
            tracing::error!("Cannot resolve {}: {}", args.target, err);
            std::process::exit(2);
        }
    };
    let reporter = match ReportWriter::open(&args.output) {
        Ok(writer) => Reporter::new(writer),
        Err(err) => {
            tracing::error!("Cannot open {}: {}", args.output, err);
            std::process::exit(2);
        }
    };

    let session = Arc::new(SimSession::new(SimProfile::new().with_peer(peer)));
    let changes = build_changes(&args, &session);
    let config = build_config(args);

    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Failed to build Tokio runtime");

    let context = RunContext::new(config);
    let session: Arc<dyn Session> = session;
    match runtime.block_on(run_client(context, session, changes, reporter)) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("Client error: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .try_init();
}

fn build_config(args: Args) -> RunConfig {
    let mut config = RunConfig::new(args.target);
    config.num_requests = args.num_requests;
    config.body = args.body;
    config.redirect_is_success = args.redirect_is_success;
    config.one_connection_per_request = args.one_connection_per_request;
    config.rotate_port = !args.disable_port_changes;
    config.version_mismatch_ok = args.version_mismatch_ok;
    config.quiet = args.quiet;
    config.policy = args.policy;
    config.route_poll_interval = Duration::from_millis(args.route_poll_ms);
    config.local_port = args.local_port;
    config.track = args.track;
    config
}

fn build_changes(
    args: &Args,
    session: &Arc<SimSession>,
) -> Option<(NetworkChangeConfig, Arc<dyn FaultInjector>)> {
    if args.changes == 0 {
        return None;
    }
    let schedule = NetworkChangeConfig {
        count: args.changes,
        interval: args.change_interval,
        trigger: args.trigger,
        start_interface: args.start_interface.clone(),
        alternate_interface: args.alternate_interface.clone(),
    };
    let injector: Arc<dyn FaultInjector> = match &args.inject_cmd {
        Some(command) => Arc::new(CommandInjector::new(
            command.program.clone(),
            command.args.clone(),
        )),
        None => Arc::new(EngineResetInjector::new(Arc::clone(session))),
    };
    Some((schedule, injector))
}

/// Fault-injection command split into program and leading arguments.
#[derive(Debug, Clone)]
struct InjectCommand {
    program: String,
    args: Vec<String>,
}

fn parse_command(input: &str) -> Result<InjectCommand, String> {
    let mut parts = input.split_whitespace().map(str::to_string);
    let Some(program) = parts.next() else {
        return Err("Command must not be empty".to_string());
    };
    Ok(InjectCommand {
        program,
        args: parts.collect(),
    })
}

fn parse_target_arg(input: &str) -> Result<Target, String> {
    parse_target(input, DEFAULT_PORT).map_err(|err| err.to_string())
}

fn parse_policy(input: &str) -> Result<MigrationPolicy, String> {
    input.parse().map_err(|err: roam_core::ConfigError| err.to_string())
}

fn parse_trigger(input: &str) -> Result<TriggerMode, String> {
    input.parse().map_err(|err: roam_core::ConfigError| err.to_string())
}

fn parse_poll_ms(input: &str) -> Result<u64, String> {
    let ms: u64 = input
        .parse()
        .map_err(|_| format!("Invalid poll interval: {}", input))?;
    if ms == 0 {
        return Err("Poll interval must be at least 1ms".to_string());
    }
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, FromArgMatches};

    fn parse(argv: &[&str]) -> Args {
        let matches = Args::command()
            .try_get_matches_from(argv)
            .expect("matches should parse");
        Args::from_arg_matches(&matches).expect("args should bind")
    }

    #[test]
    fn defaults_mirror_run_config() {
        let args = parse(&["roam-client", "example.com"]);
        assert_eq!(args.target.host, "example.com");
        assert_eq!(args.target.port, DEFAULT_PORT);
        let config = build_config(args);
        assert_eq!(config.num_requests, 1);
        assert!(config.rotate_port);
        assert_eq!(config.policy, MigrationPolicy::GatewayChange);
        assert_eq!(
            config.route_poll_interval,
            Duration::from_millis(DEFAULT_ROUTE_POLL_MS)
        );
        assert!(!config.track);
    }

    #[test]
    fn flags_flow_into_config() {
        let args = parse(&[
            "roam-client",
            "10.0.0.2:4433",
            "--num-requests",
            "5",
            "--disable-port-changes",
            "--redirect-is-success",
            "--policy",
            "any-path-change",
            "--route-poll-ms",
            "50",
            "--track",
        ]);
        let config = build_config(args);
        assert_eq!(config.target.port, 4433);
        assert_eq!(config.num_requests, 5);
        assert!(!config.rotate_port);
        assert!(config.redirect_is_success);
        assert_eq!(config.policy, MigrationPolicy::AnyPathChange);
        assert_eq!(config.route_poll_interval, Duration::from_millis(50));
        assert!(config.track);
    }

    #[test]
    fn change_schedule_requires_a_count() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        let args = parse(&["roam-client", "example.com"]);
        assert!(build_changes(&args, &session).is_none());

        let args = parse(&[
            "roam-client",
            "example.com",
            "--changes",
            "2",
            "--change-interval",
            "300",
            "--trigger",
            "sequence",
            "--start-interface",
            "eth0",
            "--alternate-interface",
            "eth1",
        ]);
        let (schedule, _) = build_changes(&args, &session).expect("schedule should build");
        assert_eq!(schedule.count, 2);
        assert_eq!(schedule.interval, 300);
        assert_eq!(schedule.trigger, TriggerMode::Sequence);
        assert_eq!(schedule.start_interface, "eth0");
        assert_eq!(schedule.alternate_interface, "eth1");
    }

    #[test]
    fn inject_command_splits_program_and_args() {
        let command = parse_command("ip netns exec client-ns").expect("command should parse");
        assert_eq!(command.program, "ip");
        assert_eq!(command.args, vec!["netns", "exec", "client-ns"]);
        assert!(parse_command("   ").is_err());
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(Args::command()
            .try_get_matches_from(["roam-client", "host:notaport"])
            .is_err());
        assert!(Args::command()
            .try_get_matches_from(["roam-client", "example.com", "--route-poll-ms", "0"])
            .is_err());
        assert!(Args::command()
            .try_get_matches_from(["roam-client", "example.com", "--trigger", "often"])
            .is_err());
    }
}
