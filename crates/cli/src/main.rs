use std::fs;
use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vmbackup::args::{resolve_password, write_password_file, Cli, Flags};
use vmbackup::host::{hostname, short_host_name};
use vmbackup::{
    load_config, preview, resolve_targets, ConfigFile, Notifier, Orchestrator, RunOptions,
    RunReport, SendmailNotifier, Settings,
};
use vmbackup_storage::StatusLog;
use vmbackup_xe::{ProcessRunner, XeClient, XeConnection};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Some(path) = cli.password_file_request() {
        write_password_file(&path, &cli.password)?;
        info!(path = %path.display(), "password file written");
        return Ok(());
    }
    let password = resolve_password(&cli.password)?;

    let flags = cli.flags();
    let xe = XeClient::new(
        ProcessRunner,
        XeConnection {
            xe_path: cli.xe_path.clone(),
            server: cli.xe_server.clone(),
            username: cli.xe_user.clone(),
            password: Some(password),
        },
    );

    let config_path = Path::new(&cli.config);
    let config_specified = config_path.is_file();
    let cfg = if config_specified {
        info!(path = %config_path.display(), "loading config file");
        load_config(config_path, flags.ignore_extra_keys)?
    } else {
        info!(selector = %cli.config, "backing up selected VMs with default settings");
        ConfigFile::from_selector(&cli.config)?
    };

    let settings = Settings::from_config(&cfg);
    settings.validate()?;
    settings.log();

    let inventory = xe.list_vm_names()?;
    let selection = resolve_targets(&cfg, &inventory)?;
    selection.log();

    if flags.preview {
        return preview(&xe, &inventory, &selection);
    }

    let host = hostname();
    let status_log = StatusLog::new(settings.status_log.clone(), short_host_name(&host));
    let mut orchestrator = Orchestrator::new(xe, settings, run_options(flags), &host);
    if config_specified {
        orchestrator = orchestrator.with_status_log(status_log.clone());
    }
    let report = orchestrator.run(&selection.ordered())?;

    if let Some(to) = &cli.mail_to {
        let from = cli
            .mail_from
            .clone()
            .unwrap_or_else(|| format!("vmbackup@{host}"));
        let notifier = SendmailNotifier {
            sendmail: cli.sendmail.clone(),
            ..SendmailNotifier::new(to.as_str(), from)
        };
        let body = if config_specified {
            fs::read_to_string(status_log.path()).unwrap_or_default()
        } else {
            report_body(&report)
        };
        let subject = format!(
            "{} {} VmBackup",
            report.summary.status(),
            orchestrator.server_name()
        );
        if let Err(err) = notifier.notify(&subject, &body) {
            error!(error = ?err, "could not send report mail");
        }
    }
    Ok(())
}

fn run_options(flags: Flags) -> RunOptions {
    RunOptions {
        compress: flags.compress,
        pre_clean: flags.pre_clean,
    }
}

fn report_body(report: &RunReport) -> String {
    let mut body: String = report
        .targets
        .iter()
        .map(|t| format!("{},{}\n", t.export_mode, t.status_line()))
        .collect();
    body.push_str(&format!("{},{}\n", report.summary.status(), report.summary));
    body
}
