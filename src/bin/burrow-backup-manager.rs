//! Server side management: drive a host backup, drop old backups, reclaim
//! unreferenced chunks.

use anyhow::{bail, Error};

use burrow_backup::server::{BackupDriver, HostConfig};
use burrow_backup::transport::TcpTransport;

const USAGE: &str = "usage:\n  \
    burrow-backup-manager backup <host-config.json> <pool-dir> <hosts-dir>\n  \
    burrow-backup-manager forget <pool-dir> <hosts-dir> <host> <backup-id>\n  \
    burrow-backup-manager gc <pool-dir> [--remove]";

async fn run_backup(args: &[String]) -> Result<(), Error> {
    let host_config = HostConfig::load(&args[0])?;
    let driver = BackupDriver::new(&args[1], &args[2])?;
    let transport = TcpTransport::new(host_config.address.clone());

    let new_backup_id = driver.next_backup_number(&host_config.host)?;
    let last_backup_id = new_backup_id - 1;

    let report = driver
        .run_backup(
            &transport,
            &host_config.host,
            host_config.to_backup_configuration(),
            last_backup_id,
            new_backup_id,
        )
        .await?;

    if !report.finished {
        bail!(
            "backup {} of {} did not finish",
            new_backup_id,
            host_config.host
        );
    }
    Ok(())
}

fn run_forget(args: &[String]) -> Result<(), Error> {
    let driver = BackupDriver::new(&args[0], &args[1])?;
    let backup_id: i32 = args[3].parse()?;
    let records = driver.forget_backup(&args[2], backup_id)?;
    println!("dropped {} records of backup {}", records, backup_id);
    Ok(())
}

// Deleting chunk files stays a deliberate operation: the scan only lists
// candidates unless --remove is given.
fn run_gc(args: &[String]) -> Result<(), Error> {
    let remove = args.get(1).map(|arg| arg == "--remove").unwrap_or(false);

    let pool = bbs_datastore::ChunkStore::open(&args[0])?;
    let refcnt = bbs_datastore::ChunkRefCount::new(&args[0]);

    let candidates = refcnt.clean_up()?;
    let mut removed = 0u64;
    for digest in &candidates {
        println!("{}", hex::encode(digest));
        if !remove {
            continue;
        }
        let (path, hex) = pool.chunk_path(digest);
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => bail!("unable to remove chunk {} - {}", hex, err),
        }
    }

    if remove {
        println!("removed {} of {} unreferenced chunk(s)", removed, candidates.len());
    } else {
        println!("{} unreferenced chunk(s), none removed", candidates.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.split_first() {
        Some((command, rest)) if command == "backup" && rest.len() == 3 => {
            run_backup(rest).await
        }
        Some((command, rest)) if command == "forget" && rest.len() == 4 => run_forget(rest),
        Some((command, rest)) if command == "gc" && (1..=2).contains(&rest.len()) => run_gc(rest),
        _ => bail!("{}", USAGE),
    }
}
