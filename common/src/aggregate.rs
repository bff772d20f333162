use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::CollectSettings,
    progress::ProgressSeries,
    source::{ProgressEntry, ResultSource},
};

/// Identity of a run, encoded in its progress file name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunKey {
    pub workload: String,
    pub configuration: String,
}

impl RunKey {
    /// `<workload><delimiter><configuration><suffix>`, possibly behind a path
    pub fn parse(name: &str, delimiter: &str, suffix: &str) -> Option<Self> {
        let base = name.rsplit('/').next().unwrap_or(name);
        let mut tokens = base.split(delimiter);
        let workload = tokens.next()?;
        let configuration = tokens.next()?.replace(suffix, "");
        if workload.is_empty() || configuration.is_empty() {
            return None;
        }
        Some(Self {
            workload: workload.to_owned(),
            configuration,
        })
    }
}

/// Every configured (workload, configuration) pair mapped to its aligned
/// series. Pairs without data hold an empty series.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    series: BTreeMap<String, BTreeMap<String, ProgressSeries>>,
}

impl AggregatedResult {
    pub fn new(workloads: &[String], configurations: &[String]) -> Self {
        let series = workloads
            .iter()
            .map(|workload| {
                let row = configurations
                    .iter()
                    .map(|cfg| (cfg.clone(), ProgressSeries::default()))
                    .collect();
                (workload.clone(), row)
            })
            .collect();
        Self { series }
    }

    /// The series for a pair, empty when nothing was ingested for it
    pub fn get(&self, workload: &str, configuration: &str) -> &ProgressSeries {
        self.series
            .get(workload)
            .and_then(|row| row.get(configuration))
            .unwrap_or(ProgressSeries::empty())
    }

    /// Stores `series` for a configured pair. An empty series never replaces
    /// ingested data. Returns false when the pair is not part of the grid.
    pub fn insert(&mut self, key: &RunKey, series: ProgressSeries) -> bool {
        match self
            .series
            .get_mut(&key.workload)
            .and_then(|row| row.get_mut(&key.configuration))
        {
            Some(slot) => {
                if series.is_empty() && !slot.is_empty() {
                    warn!(
                        "Keeping already ingested data for {},{} over an empty duplicate",
                        key.workload, key.configuration
                    );
                    return true;
                }
                if !slot.is_empty() {
                    warn!(
                        "Replacing already ingested data for {},{}",
                        key.workload, key.configuration
                    );
                }
                *slot = series;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &RunKey) -> bool {
        self.series
            .get(&key.workload)
            .is_some_and(|row| row.contains_key(&key.configuration))
    }

    pub fn non_empty(&self) -> usize {
        self.series
            .values()
            .flat_map(|row| row.values())
            .filter(|s| !s.is_empty())
            .count()
    }
}

/// Lists every source, fetches each progress file and aligns it into the grid
pub async fn aggregate(
    sources: &[Box<dyn ResultSource>],
    settings: &CollectSettings,
    workloads: &[String],
    configurations: &[String],
) -> AggregatedResult {
    let mut result = AggregatedResult::new(workloads, configurations);
    let step = settings.sample_step();

    for source in sources {
        let entries = match source.list(&settings.suffix).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Skipping {}: {err:#}", source.describe());
                continue;
            }
        };
        debug!("{} lists {} progress files", source.describe(), entries.len());

        for entry in entries {
            let Some(key) = RunKey::parse(&entry.name, &settings.delimiter, &settings.suffix)
            else {
                warn!("Cannot derive workload and configuration from {}", entry.name);
                continue;
            };
            if !result.contains(&key) {
                warn!(
                    "Ignoring {}: {},{} is not part of the plot",
                    entry.location, key.workload, key.configuration
                );
                continue;
            }

            info!("Fixing {}", entry.location);
            let series = load(source.as_ref(), &entry, step).await;
            result.insert(&key, series);
        }
    }
    result
}

/// Fetches and aligns one file. Failures degrade to an empty series.
async fn load(source: &dyn ResultSource, entry: &ProgressEntry, step: usize) -> ProgressSeries {
    let data = match source.fetch(entry).await {
        Ok(data) => data,
        Err(err) => {
            warn!("Could not fetch {}: {err:#}", entry.location);
            return ProgressSeries::default();
        }
    };
    match ProgressSeries::parse(&data).and_then(|series| series.align(step)) {
        Ok(series) => series,
        Err(err) => {
            warn!("Could not parse {}: {err}", entry.location);
            ProgressSeries::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_keys_come_from_the_base_name() {
        assert_eq!(
            RunKey::parse(
                "http://host1:8900/hashmap_tx%2Cprimitivebaseline.progress",
                "%2C",
                ".progress"
            ),
            Some(RunKey {
                workload: "hashmap_tx".to_owned(),
                configuration: "primitivebaseline".to_owned(),
            })
        );
        assert_eq!(RunKey::parse("btree.progress", "%2C", ".progress"), None);
        assert_eq!(RunKey::parse("%2Cbaseline.progress", "%2C", ".progress"), None);
    }

    #[test]
    fn grid_is_fully_populated_up_front() {
        let workloads = ["btree".to_owned(), "redis".to_owned()];
        let configurations = ["complete".to_owned(), "baseline".to_owned()];
        let result = AggregatedResult::new(&workloads, &configurations);
        for w in &workloads {
            for c in &configurations {
                assert!(result.contains(&RunKey {
                    workload: w.clone(),
                    configuration: c.clone(),
                }));
                assert!(result.get(w, c).is_empty());
            }
        }
        assert_eq!(result.non_empty(), 0);
        assert!(result.get("unknown", "complete").is_empty());
    }

    #[test]
    fn insert_rejects_pairs_outside_the_grid() {
        let mut result = AggregatedResult::new(&["btree".to_owned()], &["complete".to_owned()]);
        let key = RunKey {
            workload: "btree".to_owned(),
            configuration: "imgfuzz".to_owned(),
        };
        assert!(!result.insert(&key, ProgressSeries::default()));
    }

    #[test]
    fn empty_duplicate_keeps_ingested_data() {
        let mut result = AggregatedResult::new(&["btree".to_owned()], &["complete".to_owned()]);
        let key = RunKey {
            workload: "btree".to_owned(),
            configuration: "complete".to_owned(),
        };
        let data = ProgressSeries::parse("tick,a,b,c,d,e,f\n1,5,0,5,0,1,5\n").unwrap();
        assert!(result.insert(&key, data.clone()));
        assert!(result.insert(&key, ProgressSeries::default()));
        assert_eq!(result.get("btree", "complete"), &data);

        let newer = ProgressSeries::parse("tick,a,b,c,d,e,f\n1,9,0,9,0,1,9\n").unwrap();
        assert!(result.insert(&key, newer.clone()));
        assert_eq!(result.get("btree", "complete"), &newer);
    }
}
