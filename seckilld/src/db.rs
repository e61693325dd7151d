//! Database CLI subcommands for seckilld.
//!
//! Provides `db migrate`, `db status`, and `db init` commands.

use anyhow::{anyhow, Result};
use std::env;
use std::str::FromStr;
use tracing::info;

use seckill_db::{init_seckill_voucher, migrate, status};

/// Run database CLI subcommands.
///
/// Supported commands:
/// - `seckilld db migrate` - Run pending migrations
/// - `seckilld db status` - Check the pipeline schema and queue backlog
/// - `seckilld db init [--voucher-id N] [--stock N] [--hours N]` - Seed a voucher on sale
pub async fn run_db_command(args: Vec<String>) -> Result<()> {
    if args.len() < 3 {
        return Err(anyhow!("Usage: seckilld db <migrate|status|init> [options]"));
    }

    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow!("DATABASE_URL environment variable is required for db commands"))?;

    let pool = sqlx::PgPool::connect(&database_url).await?;

    match args[2].as_str() {
        "migrate" => {
            migrate(&pool).await?;
        },
        "status" => {
            let report = status(&pool).await?;
            if !report.is_complete() {
                return Err(anyhow!(
                    "Schema incomplete: missing tables {:?}, order uniqueness {}",
                    report.missing_tables,
                    if report.has_order_uniqueness { "present" } else { "missing" }
                ));
            }
            info!("Schema OK");
        },
        "init" => {
            let options = InitOptions::parse(&args[3..])?;
            let created = init_seckill_voucher(
                &pool,
                options.voucher_id,
                options.stock,
                options.sale_hours,
            )
            .await?;
            info!(
                voucher_id = options.voucher_id,
                stock = options.stock,
                created,
                "Seckill voucher initialized"
            );
        },
        _ => {
            return Err(anyhow!("Unknown db command: {}. Use migrate, status, or init", args[2]));
        },
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct InitOptions {
    voucher_id: i64,
    stock: i32,
    sale_hours: i32,
}

impl InitOptions {
    fn parse(args: &[String]) -> Result<Self> {
        let mut options = Self { voucher_id: 1, stock: 100, sale_hours: 24 };

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--voucher-id" => options.voucher_id = value_of(args, i)?,
                "--stock" => options.stock = value_of(args, i)?,
                "--hours" => options.sale_hours = value_of(args, i)?,
                other => return Err(anyhow!("Unknown option: {}", other)),
            }
            i += 2;
        }

        Ok(options)
    }
}

fn value_of<T: FromStr>(args: &[String], i: usize) -> Result<T> {
    let raw = args.get(i + 1).ok_or_else(|| anyhow!("{} requires a value", args[i]))?;
    raw.parse().map_err(|_| anyhow!("Invalid value for {}: {}", args[i], raw))
}
