//! Dump manifest files, journal files or the reconstructed index in a
//! human readable form.

use std::path::Path;

use anyhow::{bail, Error};

use bbs_api_types::{FileManifest, FileManifestJournalEntry, JournalEntry};
use bbs_datastore::{Manifest, RecordReader};

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Index,
    Manifest,
    Journal,
}

fn print_manifest(manifest: &FileManifest, indent: &str) {
    let stat = manifest.stat();
    println!("{}Path: {}", indent, manifest.path);
    println!("{}  Owner/Group: {}/{}", indent, stat.owner_id, stat.group_id);
    println!("{}  Size: {}", indent, stat.size);
    println!("{}  Last read: {}", indent, stat.last_read);
    println!("{}  Last modified: {}", indent, stat.last_modified);
    println!("{}  Created: {}", indent, stat.created);
    println!("{}  Mode: {:o}", indent, stat.mode);
    println!("{}  SHA256: {}", indent, hex::encode(&manifest.sha256));
    if !manifest.chunks.is_empty() {
        println!("{}  Chunks:", indent);
        for chunk in &manifest.chunks {
            println!("{}    {}", indent, hex::encode(chunk));
        }
    }
}

fn dump_manifest(path: &str) -> Result<(), Error> {
    let mut reader = RecordReader::<FileManifest>::open(path)?;
    while let Some((offset, manifest)) = reader.read_record()? {
        println!("Record at {}:", offset);
        print_manifest(&manifest, "  ");
    }
    Ok(())
}

fn dump_journal(path: &str) -> Result<(), Error> {
    let mut reader = RecordReader::<FileManifestJournalEntry>::open(path)?;
    while let Some((offset, entry)) = reader.read_record()? {
        match entry.entry {
            Some(JournalEntry::Add(manifest)) => {
                println!("ADD at {}:", offset);
                print_manifest(&manifest, "  ");
            }
            Some(JournalEntry::Modify(manifest)) => {
                println!("MODIFY at {}:", offset);
                print_manifest(&manifest, "  ");
            }
            Some(JournalEntry::Remove(path)) => println!("REMOVE at {}: {}", offset, path),
            Some(JournalEntry::Close(_)) => println!("CLOSE at {}", offset),
            None => println!("(empty entry at {})", offset),
        }
    }
    Ok(())
}

fn dump_index(path: &str) -> Result<(), Error> {
    let path = Path::new(path);
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| anyhow::format_err!("unable to derive the set name from {:?}", path))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut manifest = Manifest::new(name, dir)?;
    let index = manifest.load_index()?;
    println!("Number of elements in index: {}", index.len());

    index.walk(|entry_path, node| {
        println!("Path: {}", entry_path);
        println!("  Offset: {}", node.offset());
        println!("  IsJournal: {}", node.journal());
        println!("  Deleted: {}", node.deleted());
        println!("  Last modified: {}", node.last_modified());
        println!("  Size: {}", node.size());
    });
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let mut mode = Mode::Index;
    let mut files = Vec::new();

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--manifest" => mode = Mode::Manifest,
            "--journal" => mode = Mode::Journal,
            "--index" => mode = Mode::Index,
            "--help" | "-h" => {
                println!("usage: readindex [--manifest|--journal|--index] <file>...");
                return Ok(());
            }
            other if other.starts_with('-') => bail!("unknown option {:?}", other),
            other => files.push(other.to_string()),
        }
    }

    if files.is_empty() {
        bail!("no input files (see --help)");
    }

    for file in &files {
        match mode {
            Mode::Manifest => dump_manifest(file)?,
            Mode::Journal => dump_journal(file)?,
            Mode::Index => dump_index(file)?,
        }
    }
    Ok(())
}
