use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::constants::COUNTER_FLUSH_INTERVAL_MS;
use crate::utils::fsio;

const COUNTERS_FILE: &str = "request_counts.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    WebSearch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenUsageEntry {
    pub date: String,
    #[serde(rename = "in")]
    pub input: u64,
    #[serde(rename = "out")]
    pub output: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DayCounters {
    pub chat_requests: u64,
    pub web_search_requests: u64,
    pub web_search_results: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CountersFile {
    #[serde(default, rename = "lastResetDate")]
    last_reset_date: String,
    /// account -> date -> count
    #[serde(default)]
    requests: HashMap<String, HashMap<String, u64>>,
    #[serde(default, rename = "webSearchRequests")]
    web_search_requests: HashMap<String, HashMap<String, u64>>,
    #[serde(default, rename = "webSearchResults")]
    web_search_results: HashMap<String, HashMap<String, u64>>,
    /// Retained for every date ever seen; pruning is the operator's call.
    #[serde(default, rename = "tokenUsage")]
    token_usage: HashMap<String, Vec<TokenUsageEntry>>,
}

fn today_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

impl CountersFile {
    /// Rollover on touch: a new UTC date starts from zero, older entries stay
    /// queryable.
    fn ensure_rollover(&mut self, today: &str) {
        if self.last_reset_date != today {
            self.last_reset_date = today.to_string();
        }
    }

    fn bump(map: &mut HashMap<String, HashMap<String, u64>>, account: &str, date: &str, n: u64) {
        *map.entry(account.to_string())
            .or_default()
            .entry(date.to_string())
            .or_default() += n;
    }

    fn add_tokens(&mut self, account: &str, date: &str, input: u64, output: u64) {
        let entries = self.token_usage.entry(account.to_string()).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.date == date) {
            entry.input += input;
            entry.output += output;
        } else {
            entries.push(TokenUsageEntry {
                date: date.to_string(),
                input,
                output,
            });
        }
    }

    fn day(&self, account: &str, date: &str) -> DayCounters {
        let at = |map: &HashMap<String, HashMap<String, u64>>| {
            map.get(account)
                .and_then(|dates| dates.get(date))
                .copied()
                .unwrap_or(0)
        };
        let tokens = self
            .token_usage
            .get(account)
            .and_then(|entries| entries.iter().find(|e| e.date == date));
        DayCounters {
            chat_requests: at(&self.requests),
            web_search_requests: at(&self.web_search_requests),
            web_search_results: at(&self.web_search_results),
            input_tokens: tokens.map(|t| t.input).unwrap_or(0),
            output_tokens: tokens.map(|t| t.output).unwrap_or(0),
        }
    }
}

enum CounterEvent {
    Request {
        account_id: String,
        kind: RequestKind,
        n: u64,
    },
    SearchResults {
        account_id: String,
        n: u64,
    },
    Tokens {
        account_id: String,
        input: u64,
        output: u64,
    },
    Flush(Option<oneshot::Sender<()>>),
}

/// Usage counters. All mutation funnels through one writer task; readers get
/// consistent snapshots from the shared state.
#[derive(Clone)]
pub struct Counters {
    tx: mpsc::UnboundedSender<CounterEvent>,
    shared: Arc<RwLock<CountersFile>>,
    path: Arc<PathBuf>,
}

impl Counters {
    pub fn start() -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let path = crate::modules::auth::account::get_data_dir()?.join(COUNTERS_FILE);
        let file = if path.exists() {
            fsio::read_json(&path).unwrap_or_else(|e| {
                warn!("[Counters] Resetting unreadable counters file: {}", e);
                CountersFile::default()
            })
        } else {
            CountersFile::default()
        };

        let shared = Arc::new(RwLock::new(file));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer_loop(rx, Arc::clone(&shared), path.clone()));

        Ok((
            Self {
                tx,
                shared,
                path: Arc::new(path),
            },
            handle,
        ))
    }

    pub fn incr_request(&self, account_id: &str, kind: RequestKind, n: u64) {
        let _ = self.tx.send(CounterEvent::Request {
            account_id: account_id.to_string(),
            kind,
            n,
        });
    }

    pub fn incr_search_results(&self, account_id: &str, n: u64) {
        let _ = self.tx.send(CounterEvent::SearchResults {
            account_id: account_id.to_string(),
            n,
        });
    }

    pub fn incr_tokens(&self, account_id: &str, input: u64, output: u64) {
        let _ = self.tx.send(CounterEvent::Tokens {
            account_id: account_id.to_string(),
            input,
            output,
        });
    }

    pub fn get_today(&self, account_id: &str) -> DayCounters {
        let file = self.shared.read().unwrap_or_else(|p| p.into_inner());
        file.day(account_id, &today_utc())
    }

    pub fn get_all_days(&self, account_id: &str) -> Vec<TokenUsageEntry> {
        let file = self.shared.read().unwrap_or_else(|p| p.into_inner());
        file.token_usage.get(account_id).cloned().unwrap_or_default()
    }

    pub fn totals_today(&self) -> DayCounters {
        let today = today_utc();
        let file = self.shared.read().unwrap_or_else(|p| p.into_inner());
        let mut total = DayCounters::default();
        let accounts: std::collections::HashSet<&String> = file
            .requests
            .keys()
            .chain(file.web_search_requests.keys())
            .chain(file.token_usage.keys())
            .collect();
        for account in accounts {
            let day = file.day(account, &today);
            total.chat_requests += day.chat_requests;
            total.web_search_requests += day.web_search_requests;
            total.web_search_results += day.web_search_results;
            total.input_tokens += day.input_tokens;
            total.output_tokens += day.output_tokens;
        }
        total
    }

    /// Drains pending events and forces a write. Used on shutdown and by
    /// tests to establish a happens-before with the writer task.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(CounterEvent::Flush(Some(ack_tx))).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Last-resort synchronous flush for shutdown paths where the writer task
    /// may already be gone.
    pub fn flush_sync(&self) {
        let snapshot = {
            let file = self.shared.read().unwrap_or_else(|p| p.into_inner());
            file.clone()
        };
        if let Err(e) = fsio::write_json_atomic(&self.path, &snapshot) {
            warn!("[Counters] Shutdown flush failed: {}", e);
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<CounterEvent>,
    shared: Arc<RwLock<CountersFile>>,
    path: PathBuf,
) {
    let mut dirty = false;
    let mut interval =
        tokio::time::interval(Duration::from_millis(COUNTER_FLUSH_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let flush = |shared: &Arc<RwLock<CountersFile>>| {
        let snapshot = {
            let file = shared.read().unwrap_or_else(|p| p.into_inner());
            file.clone()
        };
        if let Err(e) = fsio::write_json_atomic(&path, &snapshot) {
            warn!("[Counters] Flush failed: {}", e);
        }
    };

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(CounterEvent::Flush(ack)) => {
                        flush(&shared);
                        dirty = false;
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    Some(event) => {
                        let today = today_utc();
                        let mut file = shared.write().unwrap_or_else(|p| p.into_inner());
                        file.ensure_rollover(&today);
                        match event {
                            CounterEvent::Request { account_id, kind, n } => match kind {
                                RequestKind::Chat => {
                                    CountersFile::bump(&mut file.requests, &account_id, &today, n)
                                }
                                RequestKind::WebSearch => CountersFile::bump(
                                    &mut file.web_search_requests,
                                    &account_id,
                                    &today,
                                    n,
                                ),
                            },
                            CounterEvent::SearchResults { account_id, n } => {
                                CountersFile::bump(
                                    &mut file.web_search_results,
                                    &account_id,
                                    &today,
                                    n,
                                );
                            }
                            CounterEvent::Tokens { account_id, input, output } => {
                                file.add_tokens(&account_id, &today, input, output);
                            }
                            CounterEvent::Flush(_) => unreachable!(),
                        }
                        drop(file);
                        dirty = true;
                    }
                    None => {
                        if dirty {
                            flush(&shared);
                        }
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                if dirty {
                    flush(&shared);
                    dirty = false;
                }
            }
        }
    }
}
