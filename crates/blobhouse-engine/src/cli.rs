//! `bhctl`: one-shot command line access to a local warehouse.
//!
//! Every invocation mounts the engine, runs one command and dismounts.

use crate::config::{WarehouseConfig, DEFAULT_USER_ROLE};
use crate::engine::DataWarehouse;
use anyhow::{Context, Result};
use blobhouse_core::{OperationContext, SecurityContext, StorageIntent};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "bhctl")]
#[command(about = "Blobhouse data warehouse CLI", long_about = None)]
pub struct Cli {
    /// TOML or JSON configuration file
    #[arg(short, long, env = "BLOBHOUSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Warehouse root directory, used when no config file is given
    #[arg(short, long, env = "BLOBHOUSE_ROOT", default_value = "./blobhouse")]
    pub root: PathBuf,

    /// Identity to act as
    #[arg(short, long, env = "BLOBHOUSE_IDENTITY", default_value = "bhctl")]
    pub identity: String,

    /// Role held by the identity (repeatable)
    #[arg(long = "role", default_values_t = [DEFAULT_USER_ROLE.to_string()])]
    pub roles: Vec<String>,

    /// Operation to run
    #[command(subcommand)]
    pub command: Command,
}

/// One warehouse operation.
#[allow(missing_docs)]
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Store a file (or stdin with `-`)
    Put {
        bucket: String,
        key: String,
        file: PathBuf,
        #[arg(long, default_value = "durable")]
        intent: StorageIntent,
    },
    /// Write an object to a file (or stdout when omitted)
    Get {
        bucket: String,
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show an object's header
    Stat { bucket: String, key: String },
    /// List objects in a bucket
    Ls {
        bucket: String,
        #[arg(short, long, default_value = "")]
        prefix: String,
    },
    /// Delete an object
    Rm { bucket: String, key: String },
    /// Probe every component
    Health,
    /// Run one garbage collection cycle
    Gc,
    /// Create a new generation of the current key
    RotateKey,
    /// Print counters as JSON
    Metrics,
}

impl Cli {
    fn warehouse_config(&self) -> Result<WarehouseConfig> {
        match &self.config {
            Some(path) => WarehouseConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(WarehouseConfig::rooted(&self.root)),
        }
    }

    fn context(&self) -> OperationContext {
        let security = self
            .roles
            .iter()
            .fold(SecurityContext::user(&self.identity), |ctx, role| ctx.with_role(role));
        OperationContext::new(security)
    }

    /// Mount, run the command, dismount.
    pub async fn run(self) -> Result<()> {
        let engine = DataWarehouse::new(self.warehouse_config()?);
        engine.mount().await?;
        let outcome = self.execute(&engine).await;
        engine.dismount().await?;
        outcome
    }

    async fn execute(&self, engine: &DataWarehouse) -> Result<()> {
        let ctx = self.context();
        match &self.command {
            Command::Put {
                bucket,
                key,
                file,
                intent,
            } => {
                let header = if file.as_os_str() == "-" {
                    engine
                        .store_object(&ctx, bucket, key, tokio::io::stdin(), *intent)
                        .await?
                } else {
                    let f = tokio::fs::File::open(file)
                        .await
                        .with_context(|| format!("opening {}", file.display()))?;
                    engine.store_object(&ctx, bucket, key, f, *intent).await?
                };
                println!("{}", serde_json::to_string_pretty(&header)?);
            }
            Command::Get {
                bucket,
                key,
                output,
            } => {
                let data = engine.retrieve_object(&ctx, bucket, key).await?;
                match output {
                    Some(path) => tokio::fs::write(path, &data).await?,
                    None => {
                        let mut stdout = tokio::io::stdout();
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                }
            }
            Command::Stat { bucket, key } => {
                let header = engine.stat_object(&ctx, bucket, key).await?;
                println!("{}", serde_json::to_string_pretty(&header)?);
            }
            Command::Ls { bucket, prefix } => {
                let headers = engine.list_objects(&ctx, bucket, prefix).await?;
                println!("{:<40} {:>12} {:<25}", "KEY", "SIZE", "MODIFIED");
                println!("{}", "-".repeat(79));
                for h in headers {
                    println!("{:<40} {:>12} {:<25}", h.key, h.size, h.modified_at.to_rfc3339());
                }
            }
            Command::Rm { bucket, key } => {
                engine.delete_object(&ctx, bucket, key).await?;
                println!("deleted {bucket}/{key}");
            }
            Command::Health => {
                let report = engine.check_health().await;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.is_healthy() {
                    anyhow::bail!("warehouse is {:?}", report.status());
                }
            }
            Command::Gc => {
                let report = engine.run_gc().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Command::RotateKey => {
                let generation = engine.rotate_key(&ctx).await?;
                println!("key rotated to generation {generation}");
            }
            Command::Metrics => {
                println!("{}", serde_json::to_string_pretty(&engine.metrics())?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put_with_intent() {
        let cli = Cli::try_parse_from(["bhctl", "put", "docs", "a.txt", "/tmp/a.txt", "--intent", "archival"])
            .unwrap();
        assert_eq!(
            cli.command,
            Command::Put {
                bucket: "docs".into(),
                key: "a.txt".into(),
                file: "/tmp/a.txt".into(),
                intent: StorageIntent::Archival,
            }
        );
        assert_eq!(cli.roles, vec![DEFAULT_USER_ROLE.to_string()]);
    }

    #[test]
    fn roles_are_repeatable() {
        let cli = Cli::try_parse_from([
            "bhctl", "--identity", "ops", "--role", "admin", "--role", "auditor", "gc",
        ])
        .unwrap();
        assert_eq!(cli.identity, "ops");
        assert_eq!(cli.roles, ["admin", "auditor"]);
        let ctx = cli.context();
        assert!(ctx.security.roles.contains("auditor"));
    }

    #[test]
    fn rejects_unknown_intent() {
        assert!(Cli::try_parse_from(["bhctl", "put", "b", "k", "f", "--intent", "hot"]).is_err());
    }

    #[tokio::test]
    async fn put_then_get_through_cli() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.bin");
        let output = dir.path().join("out.bin");
        let config = dir.path().join("blobhouse.toml");
        std::fs::write(&input, b"cli payload").unwrap();
        std::env::set_var("BLOBHOUSE_CLI_TEST_MASTER_KEY", "11".repeat(32));
        std::fs::write(
            &config,
            format!(
                "root_path = {:?}\nmaster_key_env = \"BLOBHOUSE_CLI_TEST_MASTER_KEY\"\n",
                dir.path().join("wh").display().to_string()
            ),
        )
        .unwrap();

        let args = |cmd: &[&str]| {
            let mut v = vec!["bhctl".to_string(), "--config".into(), config.display().to_string()];
            v.extend(cmd.iter().map(|s| s.to_string()));
            v
        };
        Cli::try_parse_from(args(&["put", "b", "k", input.to_str().unwrap()]))
            .unwrap()
            .run()
            .await
            .unwrap();
        Cli::try_parse_from(args(&["get", "b", "k", "-o", output.to_str().unwrap()]))
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"cli payload");
        assert!(dir.path().join("wh").join("keys.json").exists());
    }
}
