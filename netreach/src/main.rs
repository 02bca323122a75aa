use std::process;

use netreach_lib::exec::SystemRunner;
use netreach_lib::nat::{Nat, PortForward, Presence};
use netreach_lib::profile::ProfileBridge;
use netreach_lib::{addr, config, logging, nat, profile};

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    logging::setup_stdout();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match run(args).await {
        Ok(()) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}

async fn run(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    let config = match config::read(&args.config_path).await {
        Ok(config) => config,
        Err(config::Error::NoFile) => {
            tracing::debug!("no configuration file, using defaults");
            config::Config::default()
        }
        Err(e) => {
            tracing::error!(error = %e, "unable to read configuration");
            return Err(exitcode::CONFIG);
        }
    };

    let runner = SystemRunner;
    let nat = Nat::new(runner.clone(), &config.chain_prefix, config.retry.into());

    match args.command {
        cli::Command::Init => {
            nat.bootstrap().await.map_err(nat_exit)?;
        }
        cli::Command::Expose(forward) => {
            nat.bootstrap().await.map_err(nat_exit)?;
            let rule = port_forward(&nat, forward);
            nat.ensure(&rule, Presence::Present).await.map_err(nat_exit)?;
        }
        cli::Command::Withdraw(forward) => {
            nat.bootstrap().await.map_err(nat_exit)?;
            let rule = port_forward(&nat, forward);
            nat.ensure(&rule, Presence::Absent).await.map_err(nat_exit)?;
        }
        cli::Command::Sweep { ip } => {
            nat.bootstrap().await.map_err(nat_exit)?;
            let deleted = nat.sweep_all(ip).await.map_err(nat_exit)?;
            tracing::info!(%ip, deleted, "sweep finished");
        }
        cli::Command::Bind(bind) => {
            let device = bind.device.unwrap_or(config.device);
            let bound = addr::ensure_bound(&runner, bind.ip, &device)
                .await
                .map_err(addr_exit)?;
            if bound {
                addr::announce(&runner, bind.ip, &device).await.map_err(addr_exit)?;
            }
        }
        cli::Command::Unbind(bind) => {
            let device = bind.device.unwrap_or(config.device);
            addr::ensure_unbound(&runner, bind.ip, &device)
                .await
                .map_err(addr_exit)?;
        }
        cli::Command::Profile(profile) => {
            let bridge = ProfileBridge::new(runner);
            bridge
                .ensure_profile(&profile.name)
                .await
                .map_err(profile_exit)?;
            let mut deferred = false;
            for rule in &profile.allow {
                let applied = bridge
                    .ensure_rule(&profile.name, &rule.protocol.to_string(), rule.port)
                    .await
                    .map_err(profile_exit)?;
                deferred |= !applied;
            }
            if profile.default_allow {
                let applied = bridge
                    .ensure_default_allow(&profile.name)
                    .await
                    .map_err(profile_exit)?;
                deferred |= !applied;
            }
            if deferred {
                // soft: the policy service has not caught up yet, rerun later
                tracing::warn!(profile = %profile.name, "some allow-rules deferred");
                return Err(exitcode::TEMPFAIL);
            }
        }
    }
    Ok(())
}

fn port_forward(nat: &Nat<SystemRunner>, args: cli::ForwardArgs) -> PortForward {
    let chain = if args.via_output {
        nat.output_chain()
    } else {
        nat.prerouting_chain()
    };
    PortForward {
        chain: chain.to_string(),
        protocol: args.protocol,
        host_ip: args.host_ip,
        host_port: args.host_port,
        container_ip: args.container_ip,
        container_port: args.container_port,
        device: args.device,
        comment: args.comment,
    }
}

fn nat_exit(e: nat::Error) -> exitcode::ExitCode {
    tracing::error!(error = %e, "NAT reconciliation failed");
    if e.is_fatal() {
        exitcode::SOFTWARE
    } else {
        exitcode::TEMPFAIL
    }
}

fn addr_exit(e: addr::Error) -> exitcode::ExitCode {
    tracing::error!(error = %e, "address operation failed");
    exitcode::SOFTWARE
}

fn profile_exit(e: profile::Error) -> exitcode::ExitCode {
    tracing::error!(error = %e, "profile operation failed");
    exitcode::SOFTWARE
}
