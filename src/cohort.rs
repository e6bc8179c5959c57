//! Cohort sampling.
//!
//! All randomness comes from a `Pcg64Mcg` seeded from the study seed, so the
//! same user list and seed always yield the same cohort.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::Path;

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

use crate::error::{AnalysisError, AnalysisResult};

const USER_COLUMNS: [&str; 3] = ["login", "username", "user_id"];

/// Pick up to `cap` users, keeping their original order. Lists at or below
/// the cap are returned whole.
pub fn sample_users(users: &[String], cap: usize, seed: u64) -> Vec<String> {
    if users.len() <= cap {
        return users.to_vec();
    }

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, users.len(), cap).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| users[i].clone()).collect()
}

/// Read a user list, de-duplicated in first-seen order.
pub fn read_user_list<R: Read>(reader: R, source_name: &str) -> AnalysisResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader.headers()?.clone();
    let column = USER_COLUMNS
        .iter()
        .find_map(|name| headers.iter().position(|h| h.trim() == *name))
        .ok_or_else(|| AnalysisError::DataFormat {
            source_name: source_name.to_string(),
            reason: format!("missing user column (expected one of {})", USER_COLUMNS.join(", ")),
        })?;

    let mut seen = BTreeSet::new();
    let mut users = Vec::new();
    for result in reader.records() {
        let record = result?;
        let Some(user) = record.get(column).map(str::trim) else {
            continue;
        };
        if user.is_empty() {
            continue;
        }
        if seen.insert(user.to_string()) {
            users.push(user.to_string());
        }
    }

    Ok(users)
}

pub fn read_user_list_file(path: &Path) -> AnalysisResult<Vec<String>> {
    let file = std::fs::File::open(path)?;
    read_user_list(file, &path.display().to_string())
}

pub fn write_user_list<W: Write>(writer: W, users: &[String]) -> AnalysisResult<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(["login"])?;
    for user in users {
        writer.write_record([user])?;
    }
    writer.flush()?;
    Ok(())
}
