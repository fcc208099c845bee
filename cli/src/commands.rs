use std::path::PathBuf;

use clap::{Parser, Subcommand};
use director::{BladeSpec, Outcome};

use crate::{CliError, Context};

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Wipe the database and load the blades listed in a JSON file
    Init(Init),
    /// Add one blade to the pool
    AddNode(AddNode),
    /// Show one resource as seen by a requestor, or the whole fleet
    Status(Status),
    /// Print the event log of a resource
    Log(Log),
    /// Claim a blade, or queue for it
    Request(Request),
    /// Give a resource back
    Release(Release),
    /// Refresh the keepalive of everything a requestor owns
    Keepalive(Keepalive),
    /// Run the fairness loop until interrupted
    Serve(Serve),
}

impl Commands {
    pub(crate) fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        match self {
            Commands::Init(cmd) => cmd.execute(ctx),
            Commands::AddNode(cmd) => cmd.execute(ctx),
            Commands::Status(cmd) => cmd.execute(ctx),
            Commands::Log(cmd) => cmd.execute(ctx),
            Commands::Request(cmd) => cmd.execute(ctx),
            Commands::Release(cmd) => cmd.execute(ctx),
            Commands::Keepalive(cmd) => cmd.execute(ctx),
            Commands::Serve(cmd) => cmd.execute(ctx),
        }
    }
}

fn print_outcome(outcome: &Outcome) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

#[derive(Debug, Parser)]
pub(crate) struct Init {
    /// JSON array of blades: [{"ip": ..., "iloIp": ..., "iscsiIp": ...}]
    #[arg(long)]
    cluster: PathBuf,
}

impl Init {
    fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        let text = std::fs::read_to_string(&self.cluster)?;
        let blades: Vec<BladeSpec> = serde_json::from_str(&text)?;
        let count = blades.len();
        ctx.manager.init_with_resources(blades)?;
        println!("initialised {} blades", count);
        Ok(())
    }
}

#[derive(Debug, Parser)]
pub(crate) struct AddNode {
    #[arg(long)]
    ip: String,

    #[arg(long)]
    ilo_ip: String,

    #[arg(long)]
    iscsi_ip: String,

    #[arg(long, default_value_t = 0)]
    debug_port: u16,

    #[arg(long, default_value = "")]
    debug_key: String,
}

impl AddNode {
    fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        let spec = BladeSpec {
            ip: self.ip.clone(),
            ilo_ip: self.ilo_ip.clone(),
            iscsi_ip: self.iscsi_ip.clone(),
            kernel_debug_port: self.debug_port,
            kernel_debug_key: self.debug_key.clone(),
        };
        print_outcome(&ctx.manager.add_resource(spec)?)
    }
}

#[derive(Debug, Parser)]
pub(crate) struct Status {
    ip: Option<String>,

    /// Requestor to report the status for
    #[arg(long = "as", default_value = "")]
    requestor: String,
}

impl Status {
    fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        if let Some(ref ip) = self.ip {
            let status = ctx.manager.get_status(ip, &self.requestor)?;
            println!("{}", serde_json::to_string(&status)?);
            return Ok(());
        }

        let fleet = ctx.manager.list_resources()?;
        for blade in &fleet.blades {
            let ownership = blade.ownership();
            println!(
                "{:<16} {:<18} owner={:<12} next={:<12}{}",
                blade.ip(),
                ownership.state.as_str(),
                ownership.current_owner.as_deref().unwrap_or("-"),
                ownership.next_owner.as_deref().unwrap_or("-"),
                if blade.is_vm_server() { " vm-server" } else { "" },
            );
            for vm in fleet.children_of(blade.ip()) {
                println!(
                    "  {:<14} {:<18} owner={:<12} ready={}",
                    vm.ip(),
                    vm.ownership().state.as_str(),
                    vm.ownership().current_owner.as_deref().unwrap_or("-"),
                    vm.is_ready(),
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Parser)]
pub(crate) struct Log {
    ip: String,
}

impl Log {
    fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        for event in ctx.manager.resource_log(&self.ip)? {
            println!("{}", event);
        }
        Ok(())
    }
}

#[derive(Debug, Parser)]
pub(crate) struct Request {
    ip: String,

    #[arg(long = "as")]
    requestor: String,
}

impl Request {
    fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        print_outcome(&ctx.manager.request(&self.ip, &self.requestor)?)
    }
}

#[derive(Debug, Parser)]
pub(crate) struct Release {
    ip: String,

    #[arg(long = "as")]
    requestor: String,

    /// Release even if the requestor does not own the resource
    #[arg(long)]
    force: bool,
}

impl Release {
    fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        print_outcome(&ctx.manager.release(&self.ip, &self.requestor, self.force)?)
    }
}

#[derive(Debug, Parser)]
pub(crate) struct Keepalive {
    #[arg(long = "as")]
    requestor: String,
}

impl Keepalive {
    fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        ctx.manager.keep_alive(&self.requestor)?;
        Ok(())
    }
}

#[derive(Debug, Parser)]
pub(crate) struct Serve {}

impl Serve {
    fn execute(&self, ctx: &Context) -> Result<(), CliError> {
        let maintenance = ctx.manager.spawn_maintenance()?;
        tracing::info!("Serving, press ctrl-c to stop");
        ctx.runtime.block_on(tokio::signal::ctrl_c())?;
        tracing::info!("Shutting down");
        maintenance.stop();
        Ok(())
    }
}
