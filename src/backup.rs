//! Backup controller.
//!
//! A user's backup set is described by an encrypted configuration record
//! hidden at a predictable digest prefix: the record is stored with
//! padding until its address neighbors `SHA-256("USER:{user}@{YYYY-MM}")`,
//! so any machine that knows the user name can find it with a `like`
//! query and any machine that knows the passphrase can read it.
//! Independent histories from several machines merge by timestamp into a
//! single timeline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{self, Encryption, DEFAULT_MATCH};
use crate::bundle::{self, Bundle, BundleOptions};
use crate::error::{LibernetError, Result};
use crate::hash::{match_score, Identifier};
use crate::message::{Center, Progress};
use crate::store::{BlockStore, MAX_LIKE};
use crate::timestamp;
use crate::url;

/// How many calendar months of history discovery searches by default.
pub const DEFAULT_MONTHS: u32 = 5;

/// Warn when a configured source has not been backed up in this many days.
pub const DEFAULT_DAYS: f64 = 1.0;

const RECORD_KIND: &str = "backup";
const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Where and when a source directory was last backed up.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SourceState {
    /// 2001-epoch seconds of the backup.
    pub timestamp: f64,
    pub url: String,
}

/// A user's backup configuration record, the JSON document stored as an
/// encrypted block. Unknown top-level fields ride along in `extra` and
/// merge by the same newest-wins rule as the known ones.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BackupRecord {
    /// machine name -> absolute source path -> last backup (None = never).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backup: BTreeMap<String, BTreeMap<String, Option<SourceState>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Identifiers of the records this one supersedes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BackupRecord {
    fn fresh(context: &BackupContext) -> Self {
        BackupRecord {
            kind: Some(RECORD_KIND.to_string()),
            timestamp: Some(timestamp::now()),
            user: Some(context.user.clone()),
            passphrase: Some(context.passphrase.clone()),
            ..BackupRecord::default()
        }
    }

    fn machine_sources(&self, machine: &str) -> BTreeMap<String, Option<SourceState>> {
        self.backup.get(machine).cloned().unwrap_or_default()
    }
}

/// The resolved arguments a backup session runs under.
#[derive(Clone, Debug)]
pub struct BackupContext {
    pub user: String,
    pub passphrase: String,
    pub machine: String,
    pub months: u32,
    pub days: f64,
    pub assume_yes: bool,
    pub assume_no: bool,
}

/// The ideal block identifier for a user's record in a given month.
pub fn similar_identifier(user: &str, month: &str) -> Identifier {
    Identifier::of(format!("USER:{user}@{month}").as_bytes())
}

fn serialize_record(record: &BackupRecord) -> Result<String> {
    // through a Value so all keys, flattened included, serialize sorted
    let value = serde_json::to_value(record)?;
    Ok(serde_json::to_string(&value)?)
}

/// Try to read a candidate URL as this user's configuration record.
/// Anything that fails to decrypt, decompress, parse, or match the
/// user's credentials is someone else's block and is silently skipped.
fn decode_candidate(
    candidate_url: &str,
    store: &dyn BlockStore,
    context: &BackupContext,
) -> Option<BackupRecord> {
    let data = match block::fetch(candidate_url, store, true, Some(&context.passphrase)) {
        Ok(Some(data)) => data,
        _ => return None,
    };

    let raw = block::zlib_decompress(&data)?;
    let record: BackupRecord = serde_json::from_slice(&raw).ok()?;

    let valid = record.kind.as_deref() == Some(RECORD_KIND)
        && record.timestamp.is_some()
        && record.user.as_deref() == Some(context.user.as_str())
        && record.passphrase.as_deref() == Some(context.passphrase.as_str());

    valid.then_some(record)
}

/// Find every live configuration record for this user, searching one
/// month-target per calendar month back. Records listed as `previous` by
/// any candidate are superseded and dropped.
pub fn discover(
    context: &BackupContext,
    store: &dyn BlockStore,
) -> Result<BTreeMap<String, BackupRecord>> {
    let now = Utc::now();
    let mut possibilities: BTreeMap<String, Option<BackupRecord>> = BTreeMap::new();

    for months_ago in 0..context.months.max(1) {
        let month = timestamp::month_label(now, months_ago);
        let target = similar_identifier(&context.user, &month);
        let candidates = store.like(&url::for_data_block(&target, true))?;
        debug!(
            "month {month}: {} candidate blocks near {target}",
            candidates.len()
        );

        for candidate_url in candidates.keys() {
            possibilities
                .entry(candidate_url.clone())
                .or_insert_with(|| decode_candidate(candidate_url, store, context));
        }
    }

    let mut valid: BTreeMap<String, BackupRecord> = possibilities
        .into_iter()
        .filter_map(|(candidate_url, record)| record.map(|r| (candidate_url, r)))
        .collect();

    let superseded: BTreeSet<String> = valid
        .values()
        .flat_map(|record| record.previous.iter().cloned())
        .collect();

    valid.retain(|candidate_url, _| {
        url::parse(candidate_url)
            .map(|parsed| !superseded.contains(&parsed.address.to_hex()))
            .unwrap_or(false)
    });

    Ok(valid)
}

/// Fold candidate records, oldest first, into one. Top-level fields take
/// the newest value; per-path backup entries take whichever record backed
/// that path up most recently. The merged record lists every candidate as
/// `previous` so the next save retires them all.
pub fn merge_records(candidates: &BTreeMap<String, BackupRecord>) -> BackupRecord {
    let mut timeline: Vec<(&String, &BackupRecord)> = candidates.iter().collect();
    timeline.sort_by(|a, b| {
        let time_a = a.1.timestamp.unwrap_or(0.0);
        let time_b = b.1.timestamp.unwrap_or(0.0);
        time_a
            .partial_cmp(&time_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    let mut merged = BackupRecord::default();
    merged.previous = candidates
        .keys()
        .filter_map(|candidate_url| url::parse(candidate_url).ok())
        .map(|parsed| parsed.address.to_hex())
        .collect();

    for (_, record) in timeline {
        if record.kind.is_some() {
            merged.kind = record.kind.clone();
        }

        if record.timestamp.is_some() {
            merged.timestamp = record.timestamp;
        }

        if record.user.is_some() {
            merged.user = record.user.clone();
        }

        if record.passphrase.is_some() {
            merged.passphrase = record.passphrase.clone();
        }

        for (key, value) in &record.extra {
            merged.extra.insert(key.clone(), value.clone());
        }

        for (machine, paths) in &record.backup {
            let merged_machine = merged.backup.entry(machine.clone()).or_default();

            for (path, state) in paths {
                let incoming = state.as_ref().map(|s| s.timestamp).unwrap_or(0.0);
                let current = merged_machine
                    .get(path)
                    .and_then(|existing| existing.as_ref())
                    .map(|s| s.timestamp)
                    .unwrap_or(0.0);

                if incoming >= current {
                    merged_machine.insert(path.clone(), state.clone());
                }
            }
        }
    }

    merged
}

fn warn_stale_sources(context: &BackupContext, record: &BackupRecord) {
    let now = timestamp::now();
    let limit = context.days * SECONDS_PER_DAY;

    for (path, state) in record.machine_sources(&context.machine) {
        if let Some(state) = state {
            if now - state.timestamp > limit {
                warn!(
                    "no backup of {path} in the last {:.1} days",
                    (now - state.timestamp) / SECONDS_PER_DAY
                );
            }
        }
    }
}

/// Discover and merge this user's configuration, or create a fresh one.
///
/// When no prior backup exists the caller decides through `confirm` (or
/// the `--yes`/`--no` flags) whether starting fresh is intended.
pub fn load_settings(
    context: &BackupContext,
    store: &dyn BlockStore,
    confirm: Option<&dyn Fn(&str) -> bool>,
) -> Result<BackupRecord> {
    let candidates = discover(context, store)?;
    let merged = merge_records(&candidates);

    if !merged.backup.is_empty() {
        info!("found {} configuration record(s)", candidates.len());
        warn_stale_sources(context, &merged);
        return Ok(merged);
    }

    let prompt = format!(
        "Unable to find backups in the last {} months, create new? ",
        context.months
    );

    let create = if context.assume_yes {
        println!("{prompt}Yes");
        true
    } else if context.assume_no {
        println!("{prompt}No");
        false
    } else {
        confirm.map(|ask| ask(&prompt)).unwrap_or(false)
    };

    if !create {
        return Err(LibernetError::Invariant(
            "previous backups not found".to_string(),
        ));
    }

    Ok(BackupRecord::fresh(context))
}

/// Register sources for this machine. Returns whether anything changed.
pub fn add_sources(
    record: &mut BackupRecord,
    context: &BackupContext,
    sources: &[PathBuf],
) -> Result<bool> {
    let machine = record.backup.entry(context.machine.clone()).or_default();
    let mut changed = false;

    for source in sources {
        let real = std::fs::canonicalize(source)
            .map_err(|e| LibernetError::io(e, source))?
            .to_string_lossy()
            .into_owned();

        if machine.contains_key(&real) {
            println!("WARNING: we already have {real}");
        } else {
            machine.insert(real, None);
            changed = true;
        }
    }

    Ok(changed)
}

/// Unregister sources for this machine. Returns whether anything changed.
pub fn remove_sources(
    record: &mut BackupRecord,
    context: &BackupContext,
    sources: &[PathBuf],
) -> Result<bool> {
    let machine = record.backup.entry(context.machine.clone()).or_default();
    let mut changed = false;

    for source in sources {
        let real = std::fs::canonicalize(source)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| source.to_string_lossy().into_owned());

        if machine.remove(&real).is_some() {
            println!("No longer backing up: {real}");
            changed = true;
        } else {
            println!("We are already not backing up: {real}");
        }
    }

    Ok(changed)
}

/// Human-readable listing of this machine's sources.
pub fn list_sources(record: &BackupRecord, context: &BackupContext) -> Vec<String> {
    let sources = record.machine_sources(&context.machine);

    if sources.is_empty() {
        return vec![
            "No sources set to backup".to_string(),
            "Try `add --source ...`".to_string(),
        ];
    }

    sources
        .iter()
        .map(|(path, state)| match state {
            None => format!("NOT BACKED UP: {path}"),
            Some(state) => format!(
                "{path} (backed up {:.1} days ago)",
                (timestamp::now() - state.timestamp) / SECONDS_PER_DAY
            ),
        })
        .collect()
}

/// Back up every configured source for this machine. Each source's
/// previous bundle seeds incremental reuse. Returns whether anything
/// changed.
pub fn run_backup(
    record: &mut BackupRecord,
    context: &BackupContext,
    store: &dyn BlockStore,
    messages: Option<&Center<Progress>>,
    options: &BundleOptions,
) -> Result<bool> {
    let sources = record.machine_sources(&context.machine);
    let mut changed = false;

    for (source, state) in sources {
        if let Some(center) = messages {
            let _ = center.send(Progress::Source(source.clone()));
        }

        if !Path::new(&source).is_dir() {
            println!("Directory not found: {source}");
            continue;
        }

        let previous: Option<Bundle> = match &state {
            Some(state) => bundle::inflate(&state.url, store)?,
            None => None,
        };

        let started = Instant::now();
        let bundle_url = bundle::create(
            Path::new(&source),
            store,
            previous.as_ref(),
            messages,
            options,
        )?;
        info!(
            "duration: {:.3} seconds for {source}",
            started.elapsed().as_secs_f64()
        );

        record
            .backup
            .entry(context.machine.clone())
            .or_default()
            .insert(
                source,
                Some(SourceState {
                    url: bundle_url,
                    timestamp: timestamp::now(),
                }),
            );
        changed = true;
    }

    Ok(changed)
}

/// Pick the output directory for one restored source.
///
/// No destination restores in place. A single source restores to the
/// destination itself. Several sources with unique names land in
/// `destination/{name}`; colliding names keep their full source path
/// under the destination.
fn destination_path(source: &str, destination: Option<&Path>, sources: &[String]) -> PathBuf {
    let Some(destination) = destination else {
        return PathBuf::from(source);
    };

    if sources.len() == 1 {
        return destination.to_path_buf();
    }

    let names: BTreeSet<&str> = sources
        .iter()
        .filter_map(|s| Path::new(s).file_name().and_then(|n| n.to_str()))
        .collect();

    if names.len() == sources.len() {
        let name = Path::new(source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.to_string());
        return destination.join(name);
    }

    destination.join(source.trim_start_matches(['/', '\\']))
}

/// Restore sources (all of this machine's, or the requested subset).
pub fn run_restore(
    record: &BackupRecord,
    context: &BackupContext,
    store: &dyn BlockStore,
    messages: Option<&Center<Progress>>,
    requested: &[PathBuf],
    destination: Option<&Path>,
) -> Result<()> {
    let sources = record.machine_sources(&context.machine);
    let requested: Vec<String> = requested
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    let selected: Vec<String> = if requested.is_empty() {
        sources.keys().cloned().collect()
    } else {
        let missing: Vec<&String> = requested
            .iter()
            .filter(|r| !sources.contains_key(*r))
            .collect();

        if !missing.is_empty() {
            println!("ERROR: The following were specified but were not scheduled for backup");

            for path in &missing {
                println!("\t{path}");
            }
        }

        requested
            .iter()
            .filter(|r| sources.contains_key(*r))
            .cloned()
            .collect()
    };

    for source in &selected {
        if let Some(center) = messages {
            let _ = center.send(Progress::Source(source.clone()));
        }

        let Some(Some(state)) = sources.get(source) else {
            println!("ERROR: not backed up yet: {source}");
            continue;
        };

        let target = destination_path(source, destination, &selected);
        let missing = bundle::restore(&state.url, &target, store, messages)?;

        if let Some(missing) = missing {
            println!("ERROR: The following blocks are missing:");

            for block_url in missing {
                println!("\t{block_url}");
            }
        }
    }

    Ok(())
}

/// The prefix score a new record must reach to stay discoverable.
///
/// While the shard has room the default applies; once `like` returns a
/// full set, the new record must beat the weakest existing match, which
/// monotonically converges the shard on the newest configuration.
pub fn target_match_score(similar: &Identifier, store: &dyn BlockStore) -> Result<u32> {
    let existing = store.like(&url::for_data_block(similar, false))?;

    if existing.len() < MAX_LIKE {
        return Ok(DEFAULT_MATCH);
    }

    let weakest = existing
        .keys()
        .filter_map(|candidate_url| url::parse(candidate_url).ok())
        .map(|parsed| match_score(&parsed.address, similar))
        .min()
        .unwrap_or(DEFAULT_MATCH);
    Ok(weakest + 1)
}

/// Persist the record: compact JSON, deflated, passphrase-encrypted, and
/// padded until its address lands near this month's target identifier.
pub fn save(
    record: &mut BackupRecord,
    context: &BackupContext,
    store: &dyn BlockStore,
) -> Result<String> {
    record.timestamp = Some(timestamp::now());
    let raw = serialize_record(record)?;
    // passphrase blocks never compress in the codec, so deflate here
    let compressed = block::zlib_compress(raw.as_bytes());

    let month = timestamp::month_label(Utc::now(), 0);
    let similar = similar_identifier(&context.user, &month);
    let score = target_match_score(&similar, store)?;
    debug!("saving configuration near {similar} at score {score}");

    let (record_url, _) = block::store(
        &compressed,
        store,
        &Encryption::Passphrase(context.passphrase.clone()),
        Some(&similar),
        score,
    )?;
    Ok(record_url)
}
