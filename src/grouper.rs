use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::domain::{Issue, IssueKind, ParsedFileName, ReadDirection, SampleStatus};
use crate::sample::{FileGroup, LaneFile, LogicalSample, SampleFiles};
use crate::source::RawFile;

#[derive(Debug, Clone, Serialize)]
pub struct RejectedFile {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct GroupingOutcome {
    pub samples: Vec<LogicalSample>,
    pub rejected: Vec<RejectedFile>,
}

#[derive(Debug, Clone)]
pub struct FileGrouper {
    project_id: Option<u64>,
    host_genome: Option<String>,
    client: String,
}

impl Default for FileGrouper {
    fn default() -> Self {
        Self {
            project_id: None,
            host_genome: None,
            client: "cli".to_string(),
        }
    }
}

impl FileGrouper {
    pub fn new(project_id: Option<u64>, host_genome: Option<String>) -> Self {
        Self {
            project_id,
            host_genome,
            ..Self::default()
        }
    }

    pub fn group(&self, files: Vec<RawFile>) -> GroupingOutcome {
        self.merge(&[], files)
    }

    /// Unions `files` into `existing`. Files whose name is already present are
    /// dropped; samples whose file set did not change are kept as they were.
    pub fn merge(&self, existing: &[LogicalSample], files: Vec<RawFile>) -> GroupingOutcome {
        let mut seen = HashSet::new();
        let mut parsed = Vec::new();
        let mut rejected = Vec::new();

        let previous = existing
            .iter()
            .flat_map(|sample| sample.member_files())
            .cloned()
            .collect::<Vec<_>>();
        for member in previous {
            if seen.insert(member.name().to_string()) {
                parsed.push(member);
            }
        }

        for file in files {
            if !seen.insert(file.name().to_string()) {
                debug!(file = file.name(), "dropping duplicate file");
                continue;
            }
            match file.name().parse::<ParsedFileName>() {
                Ok(name) => parsed.push(LaneFile { file, parsed: name }),
                Err(err) => rejected.push(RejectedFile {
                    name: file.name().to_string(),
                    reason: err.to_string(),
                }),
            }
        }

        let mut by_sample = BTreeMap::<String, Vec<LaneFile>>::new();
        for member in parsed {
            by_sample
                .entry(member.parsed.sample.clone())
                .or_default()
                .push(member);
        }

        let previous_by_name = existing
            .iter()
            .map(|sample| (sample.name.as_str(), sample))
            .collect::<HashMap<_, _>>();

        let samples = by_sample
            .into_iter()
            .map(|(name, members)| {
                if let Some(prior) = previous_by_name.get(name.as_str()) {
                    if same_members(prior, &members) {
                        return (*prior).clone();
                    }
                }
                self.build_sample(name, members)
            })
            .collect();

        GroupingOutcome { samples, rejected }
    }

    fn build_sample(&self, name: String, members: Vec<LaneFile>) -> LogicalSample {
        let mut slots = BTreeMap::<ReadDirection, Vec<LaneFile>>::new();
        for member in members {
            slots.entry(member.parsed.direction).or_default().push(member);
        }

        let (files, issue) = arrange(&name, slots);
        let status = if issue.is_some() {
            SampleStatus::Invalid
        } else {
            SampleStatus::Created
        };
        LogicalSample {
            name,
            project_id: self.project_id,
            host_genome: self.host_genome.clone(),
            files,
            client: self.client.clone(),
            status,
            issue,
        }
    }
}

fn arrange(
    name: &str,
    mut slots: BTreeMap<ReadDirection, Vec<LaneFile>>,
) -> (SampleFiles, Option<Issue>) {
    let unpaired = slots.remove(&ReadDirection::Unpaired).unwrap_or_default();
    let r1 = slots.remove(&ReadDirection::R1).unwrap_or_default();
    let r2 = slots.remove(&ReadDirection::R2).unwrap_or_default();

    if !unpaired.is_empty() && (!r1.is_empty() || !r2.is_empty()) {
        let all = unpaired.into_iter().chain(r1).chain(r2).collect();
        return ambiguous(
            ReadDirection::Unpaired,
            all,
            format!("{name}: both unpaired and R1/R2 files"),
        );
    }

    let conflict = [
        (ReadDirection::Unpaired, &unpaired),
        (ReadDirection::R1, &r1),
        (ReadDirection::R2, &r2),
    ]
    .into_iter()
    .find_map(|(direction, slot)| {
        slot_conflict(name, direction, slot).map(|message| (direction, message))
    });
    if let Some((direction, message)) = conflict {
        let all = unpaired.into_iter().chain(r1).chain(r2).collect();
        return ambiguous(direction, all, message);
    }

    match (r1.is_empty(), r2.is_empty()) {
        (false, false) => {
            if lane_set(&r1) != lane_set(&r2) {
                let message = format!("{name}: R1 and R2 are split over different lanes");
                let all = r1.into_iter().chain(r2).collect();
                return ambiguous(ReadDirection::Unpaired, all, message);
            }
            (
                SampleFiles::Paired {
                    r1: FileGroup::new(ReadDirection::R1, r1),
                    r2: FileGroup::new(ReadDirection::R2, r2),
                },
                None,
            )
        }
        (false, true) => (SampleFiles::Single(FileGroup::new(ReadDirection::R1, r1)), None),
        (true, false) => (SampleFiles::Single(FileGroup::new(ReadDirection::R2, r2)), None),
        (true, true) => (
            SampleFiles::Single(FileGroup::new(ReadDirection::Unpaired, unpaired)),
            None,
        ),
    }
}

// Several files in one slot are only acceptable as distinct lanes.
fn slot_conflict(name: &str, direction: ReadDirection, slot: &[LaneFile]) -> Option<String> {
    if slot.len() < 2 {
        return None;
    }
    let label = direction.marker().unwrap_or("unpaired");
    let mut lanes = HashSet::new();
    for member in slot {
        match member.parsed.lane {
            Some(lane) if lanes.insert(lane) => {}
            Some(lane) => {
                return Some(format!("{name} {label}: lane {lane} appears more than once"));
            }
            None => {
                return Some(format!(
                    "{name} {label}: {} files map to the same slot",
                    slot.len()
                ));
            }
        }
    }
    None
}

fn lane_set(slot: &[LaneFile]) -> Vec<Option<u16>> {
    let mut lanes = slot
        .iter()
        .map(|member| member.parsed.lane)
        .collect::<Vec<_>>();
    lanes.sort();
    lanes
}

fn ambiguous(
    direction: ReadDirection,
    members: Vec<LaneFile>,
    message: String,
) -> (SampleFiles, Option<Issue>) {
    (
        SampleFiles::Single(FileGroup::new(direction, members)),
        Some(Issue::new(IssueKind::GroupingAmbiguity, message)),
    )
}

fn same_members(sample: &LogicalSample, members: &[LaneFile]) -> bool {
    let mut current = sample.member_names();
    let mut incoming = members
        .iter()
        .map(|member| member.name().to_string())
        .collect::<Vec<_>>();
    current.sort();
    incoming.sort();
    current == incoming
}

/// Renames samples whose name is already taken in the destination project by
/// appending the first free `_N` suffix. Names used elsewhere in the batch
/// count as taken too.
pub fn dedupe_names(samples: Vec<LogicalSample>, taken: &HashSet<String>) -> Vec<LogicalSample> {
    let mut used = taken.clone();
    used.extend(
        samples
            .iter()
            .filter(|sample| !taken.contains(&sample.name))
            .map(|sample| sample.name.clone()),
    );
    samples
        .into_iter()
        .map(|mut sample| {
            if taken.contains(&sample.name) {
                let base = sample.name.clone();
                let mut suffix = 1usize;
                while used.contains(&format!("{base}_{suffix}")) {
                    suffix += 1;
                }
                sample.name = format!("{base}_{suffix}");
                debug!(from = %base, to = %sample.name, "renamed sample");
                used.insert(sample.name.clone());
            }
            sample
        })
        .collect()
}

pub fn flatten(samples: &[LogicalSample]) -> Vec<RawFile> {
    samples
        .iter()
        .flat_map(|sample| sample.member_files())
        .map(|member| member.file.clone())
        .collect()
}
