//! Trust anchors: the rotating set of chain roots that proofs are checked against.
//!
//! An [`AnchorSync`] owns the current [`AnchorSet`] and keeps it fresh from one of three
//! mutually exclusive sources: a local JSON file, a quorum of remote URLs, or a fixed
//! list. The set is never mutated in place. Every refresh builds a new [`AnchorSet`] and
//! swaps it in, so readers holding a snapshot always see a consistent table and
//! staleness threshold.

use std::{
    collections::{HashMap, hash_map::Entry},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use fabric_base::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use n0_future::{
    join_all,
    task::{self, AbortOnDropHandle},
};
use nested_enum_utils::common_fields;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};
use url::Url;

use crate::{
    defaults,
    metrics::Metrics,
    veritas::{ProofError, SignatureError, SpaceProof, Veritas},
};

/// Timeout for a single remote anchor fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A trusted chain checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Merkle root of the space tree at this block.
    #[serde(with = "hex32")]
    pub root: [u8; 32],
    /// The block the root was taken at.
    pub block: Block,
}

/// Block identifying an [`Anchor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block hash.
    #[serde(with = "hex32")]
    pub hash: [u8; 32],
    /// Block height, used as the trust point of the anchor.
    pub height: u32,
}

mod hex32 {
    use super::*;

    pub fn serialize<S: serde::Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&HEXLOWER.encode(bytes))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// An immutable snapshot of the trusted anchors.
#[derive(Debug, Clone, Default)]
pub struct AnchorSet {
    /// Sorted by height, most recent first. Roots are unique.
    anchors: Vec<Anchor>,
    trust_points: HashMap<[u8; 32], u32>,
    stale_threshold: u32,
}

impl AnchorSet {
    /// Builds a set, dropping anchors whose root was already seen at a greater height.
    ///
    /// With more than [`defaults::STALENESS_DEPTH`] anchors, trust points below the
    /// height of the [`defaults::STALENESS_DEPTH`]th oldest anchor are stale. Otherwise
    /// nothing is stale.
    pub fn new(mut anchors: Vec<Anchor>) -> Self {
        anchors.sort_by(|a, b| b.block.height.cmp(&a.block.height));
        let mut trust_points = HashMap::with_capacity(anchors.len());
        anchors.retain(|anchor| match trust_points.entry(anchor.root) {
            Entry::Vacant(entry) => {
                entry.insert(anchor.block.height);
                true
            }
            Entry::Occupied(_) => false,
        });
        let stale_threshold = if anchors.len() > defaults::STALENESS_DEPTH {
            anchors[anchors.len() - defaults::STALENESS_DEPTH].block.height
        } else {
            0
        };
        Self {
            anchors,
            trust_points,
            stale_threshold,
        }
    }

    /// The trust point of `root`, if it is anchored.
    pub fn trust_point(&self, root: &[u8; 32]) -> Option<u32> {
        self.trust_points.get(root).copied()
    }

    /// Whether a proof at `trust_point` is outdated.
    pub fn is_stale(&self, trust_point: u32) -> bool {
        trust_point < self.stale_threshold
    }

    /// Trust points strictly below this are stale.
    pub fn stale_threshold(&self) -> u32 {
        self.stale_threshold
    }

    /// The most recent anchor.
    pub fn latest(&self) -> Option<&Anchor> {
        self.anchors.first()
    }

    /// Anchors, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &Anchor> {
        self.anchors.iter()
    }

    /// Number of anchors.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Where anchors come from and how often they are refreshed.
///
/// Exactly one of `local_path`, `remote_urls` and `static_anchors` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorOptions {
    /// JSON file with anchors, watched for changes.
    pub local_path: Option<PathBuf>,
    /// URLs serving anchor JSON, combined by quorum.
    pub remote_urls: Option<Vec<Url>>,
    /// A fixed anchor list. Never refreshed.
    pub static_anchors: Option<Vec<Anchor>>,
    /// Periodic refresh interval.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Delay between failed remote fetches.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// How often the local file is polled for changes.
    #[serde(with = "humantime_serde")]
    pub watch_interval: Duration,
}

impl Default for AnchorOptions {
    fn default() -> Self {
        Self {
            local_path: None,
            remote_urls: None,
            static_anchors: None,
            check_interval: defaults::ANCHOR_CHECK_INTERVAL,
            retry_delay: defaults::ANCHOR_RETRY_DELAY,
            watch_interval: defaults::ANCHOR_WATCH_INTERVAL,
        }
    }
}

impl AnchorOptions {
    /// Options reading a local file.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Options fetching from remote URLs.
    pub fn remote(urls: impl IntoIterator<Item = Url>) -> Self {
        Self {
            remote_urls: Some(urls.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Options with a fixed anchor list.
    pub fn fixed(anchors: Vec<Anchor>) -> Self {
        Self {
            static_anchors: Some(anchors),
            ..Default::default()
        }
    }

    /// Whether any source is configured.
    pub fn has_source(&self) -> bool {
        self.source_count() > 0
    }

    fn source_count(&self) -> usize {
        [
            self.local_path.is_some(),
            self.remote_urls.as_ref().is_some_and(|urls| !urls.is_empty()),
            self.static_anchors.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// Errors creating an [`AnchorSync`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum AnchorError {
    #[snafu(display("exactly one of local, remote or static anchors must be set, found {count}"))]
    Config { count: usize },
    #[snafu(display("a valid anchors source is required"))]
    NoValidSource { source: LoadError },
}

/// Errors loading anchors from a source.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum LoadError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("malformed anchors file"))]
    Parse { source: serde_json::Error },
    #[snafu(display("no valid remote anchors found"))]
    NoQuorum {},
}

#[derive(Debug)]
enum Loader {
    Local(PathBuf),
    Remote {
        client: reqwest::Client,
        urls: Vec<Url>,
    },
    Static,
}

impl Loader {
    /// Loads a fresh anchor list, `None` for static sources.
    async fn load(&self) -> Result<Option<Vec<Anchor>>, LoadError> {
        match self {
            Self::Local(path) => read_local(path).await.map(Some),
            Self::Remote { client, urls } => fetch_remote(client, urls).await.map(Some),
            Self::Static => Ok(None),
        }
    }
}

async fn read_local(path: &Path) -> Result<Vec<Anchor>, LoadError> {
    let data = tokio::fs::read(path).await.context(ReadSnafu { path })?;
    let anchors = serde_json::from_slice(&data).context(ParseSnafu)?;
    Ok(anchors)
}

async fn fetch_remote(client: &reqwest::Client, urls: &[Url]) -> Result<Vec<Anchor>, LoadError> {
    let responses = join_all(urls.iter().map(|url| fetch_one(client, url))).await;
    select_quorum(responses.into_iter().flatten()).context(NoQuorumSnafu)
}

async fn fetch_one(client: &reqwest::Client, url: &Url) -> Option<Vec<Anchor>> {
    debug!(%url, "fetching anchors");
    let res = async {
        client
            .get(url.clone())
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Anchor>>()
            .await
    }
    .await;
    match res {
        Ok(anchors) => Some(anchors),
        Err(err) => {
            warn!(%url, "failed to fetch anchors: {err}");
            None
        }
    }
}

/// Picks the anchor list most sources agree on.
///
/// Responses are grouped by the root of their first entry. The largest group wins, ties
/// go to the group whose first anchor is higher, and remaining ties to the group seen
/// first. Empty responses do not vote.
pub fn select_quorum(responses: impl IntoIterator<Item = Vec<Anchor>>) -> Option<Vec<Anchor>> {
    struct Group {
        root: [u8; 32],
        height: u32,
        count: usize,
        anchors: Vec<Anchor>,
    }

    let mut groups: Vec<Group> = Vec::new();
    for anchors in responses {
        let Some(first) = anchors.first() else {
            continue;
        };
        match groups.iter_mut().find(|group| group.root == first.root) {
            Some(group) => group.count += 1,
            None => groups.push(Group {
                root: first.root,
                height: first.block.height,
                count: 1,
                anchors,
            }),
        }
    }

    let mut chosen: Option<Group> = None;
    for group in groups {
        let better = chosen.as_ref().is_none_or(|best| {
            group.count > best.count || (group.count == best.count && group.height > best.height)
        });
        if better {
            chosen = Some(group);
        }
    }
    chosen.map(|group| group.anchors)
}

#[derive(Debug)]
struct AnchorState {
    current: RwLock<Arc<AnchorSet>>,
    metrics: Arc<Metrics>,
}

impl AnchorState {
    fn replace(&self, anchors: Vec<Anchor>) {
        let set = AnchorSet::new(anchors);
        match set.latest() {
            Some(latest) => info!(
                count = set.len(),
                stale_threshold = set.stale_threshold(),
                "anchors refreshed, latest block {}",
                latest.block.height
            ),
            None => warn!("anchors refreshed with an empty set"),
        }
        *self.current.write() = Arc::new(set);
        self.metrics.anchor_refreshes.inc();
    }
}

/// Keeps the anchor set fresh and answers trust questions against it.
///
/// Cloning is cheap and clones share the same set. Background refreshing stops on
/// [`AnchorSync::shutdown`] or when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct AnchorSync {
    state: Arc<AnchorState>,
    loader: Arc<Loader>,
    veritas: Arc<dyn Veritas>,
    cancel: CancellationToken,
    _task: Option<Arc<AbortOnDropHandle<()>>>,
}

impl AnchorSync {
    /// Creates the synchronizer and performs the initial load.
    ///
    /// Fails if not exactly one source is configured, or if the initial load from a
    /// local or remote source fails.
    pub async fn create(
        options: AnchorOptions,
        veritas: Arc<dyn Veritas>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, AnchorError> {
        let count = options.source_count();
        snafu::ensure!(count == 1, ConfigSnafu { count });

        let state = Arc::new(AnchorState {
            current: Default::default(),
            metrics,
        });
        let cancel = CancellationToken::new();

        let loader = if let Some(anchors) = options.static_anchors.clone() {
            state.replace(anchors);
            Arc::new(Loader::Static)
        } else {
            let loader = match (&options.local_path, &options.remote_urls) {
                (Some(path), _) => Loader::Local(path.clone()),
                (None, Some(urls)) => Loader::Remote {
                    client: reqwest::Client::new(),
                    urls: urls.clone(),
                },
                (None, None) => return Err(ConfigSnafu { count: 0usize }.build()),
            };
            let anchors = loader
                .load()
                .await
                .inspect_err(|_| {
                    state.metrics.anchor_refresh_failures.inc();
                })
                .context(NoValidSourceSnafu)?
                .unwrap_or_default();
            state.replace(anchors);
            Arc::new(loader)
        };

        let task = match loader.as_ref() {
            Loader::Static => None,
            Loader::Local(path) => {
                let fut = watch_local(
                    path.clone(),
                    loader.clone(),
                    state.clone(),
                    cancel.clone(),
                    options.clone(),
                );
                let span = error_span!("anchor_watch", path = %path.display());
                Some(task::spawn(fut.instrument(span)))
            }
            Loader::Remote { .. } => {
                let fut = refresh_remote(loader.clone(), state.clone(), cancel.clone(), options);
                Some(task::spawn(fut.instrument(error_span!("anchor_refresh"))))
            }
        };

        Ok(Self {
            state,
            loader,
            veritas,
            cancel,
            _task: task.map(|handle| Arc::new(AbortOnDropHandle::new(handle))),
        })
    }

    /// The current anchor set.
    ///
    /// Decisions that compare several trust points should use a single snapshot.
    pub fn snapshot(&self) -> Arc<AnchorSet> {
        self.state.current.read().clone()
    }

    /// The trust point of `root`, if it is currently anchored.
    pub fn trust_point(&self, root: &[u8; 32]) -> Option<u32> {
        self.state.current.read().trust_point(root)
    }

    /// Whether a proof at `trust_point` is outdated under the current set.
    pub fn is_stale(&self, trust_point: u32) -> bool {
        self.state.current.read().is_stale(trust_point)
    }

    /// Verifies a BIP-340 signature over a digest.
    pub fn verify_signature(
        &self,
        public_key: &[u8; PUBLIC_KEY_LENGTH],
        digest: &[u8; 32],
        signature: &[u8; SIGNATURE_LENGTH],
    ) -> Result<(), SignatureError> {
        self.veritas.verify_schnorr(public_key, digest, signature)
    }

    /// Parses and verifies a UTXO proof.
    pub fn verify_proof(&self, proof: &[u8]) -> Result<Box<dyn SpaceProof>, ProofError> {
        self.veritas.verify_proof(proof)
    }

    /// Reloads from the configured source right away.
    ///
    /// On failure the current set is kept.
    pub async fn refresh(&self) -> Result<(), LoadError> {
        if let Some(anchors) = self.loader.load().await? {
            self.state.replace(anchors);
        }
        Ok(())
    }

    /// Replaces the anchor set with `anchors`.
    pub fn replace(&self, anchors: Vec<Anchor>) {
        self.state.replace(anchors);
    }

    /// Stops background refreshing. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!("stopping anchor refresh");
            self.cancel.cancel();
        }
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn refresh_remote(
    loader: Arc<Loader>,
    state: Arc<AnchorState>,
    cancel: CancellationToken,
    options: AnchorOptions,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = time::sleep(options.check_interval) => {}
        }
        // retry with a fixed delay until a fetch succeeds
        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = loader.load() => res,
            };
            match res {
                Ok(anchors) => {
                    state.replace(anchors.unwrap_or_default());
                    break;
                }
                Err(err) => {
                    state.metrics.anchor_refresh_failures.inc();
                    warn!(
                        "anchor refresh failed: {err}. retrying in {:?}",
                        options.retry_delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = time::sleep(options.retry_delay) => {}
                    }
                }
            }
        }
    }
    debug!("anchor refresh stopped");
}

type FileStamp = Option<(Option<SystemTime>, u64)>;

async fn file_stamp(path: &Path) -> FileStamp {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.modified().ok(), meta.len()))
}

async fn watch_local(
    path: PathBuf,
    loader: Arc<Loader>,
    state: Arc<AnchorState>,
    cancel: CancellationToken,
    options: AnchorOptions,
) {
    let mut last = file_stamp(&path).await;
    let mut watch = time::interval_at(
        Instant::now() + options.watch_interval,
        options.watch_interval,
    );
    watch.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut check = time::interval_at(
        Instant::now() + options.check_interval,
        options.check_interval,
    );
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let reason = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = watch.tick() => {
                let stamp = file_stamp(&path).await;
                if stamp == last {
                    continue;
                }
                last = stamp;
                "file changed"
            }
            _ = check.tick() => "interval elapsed",
        };
        debug!("reloading anchors ({reason})");
        match loader.load().await {
            Ok(anchors) => state.replace(anchors.unwrap_or_default()),
            Err(err) => {
                state.metrics.anchor_refresh_failures.inc();
                warn!("keeping previous anchors: {err}");
            }
        }
    }
    debug!("anchor watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn anchor(seed: u8, height: u32) -> Anchor {
        Anchor {
            root: [seed; 32],
            block: Block {
                hash: [seed.wrapping_add(100); 32],
                height,
            },
        }
    }

    fn set_of(heights: &[u32]) -> AnchorSet {
        AnchorSet::new(
            heights
                .iter()
                .enumerate()
                .map(|(i, h)| anchor(i as u8, *h))
                .collect(),
        )
    }

    #[test]
    fn staleness_threshold() {
        let set = set_of(&[100, 95, 90, 85, 80, 75, 70, 65, 60, 50]);
        assert_eq!(set.stale_threshold(), 95);
        assert!(set.is_stale(90));
        assert!(!set.is_stale(95));
        assert_eq!(set.latest().map(|a| a.block.height), Some(100));

        let set = set_of(&[100, 95, 90, 85, 80, 75, 70, 65, 60, 55, 50]);
        assert_eq!(set.stale_threshold(), 90);
    }

    #[test]
    fn staleness_threshold_counts_from_the_oldest() {
        let heights: Vec<u32> = (0..20).map(|i| 200 - 5 * i).collect();
        let set = set_of(&heights);
        assert_eq!(set.stale_threshold(), 145);
        assert!(set.is_stale(140));
        assert!(!set.is_stale(145));
        assert!(!set.is_stale(150));
    }

    #[test]
    fn nothing_is_stale_with_few_anchors() {
        let anchors = (0..9).map(|i| anchor(i, 100 + i as u32)).collect();
        let set = AnchorSet::new(anchors);
        assert_eq!(set.stale_threshold(), 0);
        assert!(!set.is_stale(0));
        assert!(!AnchorSet::default().is_stale(0));
    }

    #[test]
    fn unordered_input_and_duplicate_roots() {
        let set = AnchorSet::new(vec![anchor(1, 10), anchor(2, 30), anchor(1, 20)]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.trust_point(&[1; 32]), Some(20));
        assert_eq!(set.trust_point(&[2; 32]), Some(30));
        assert_eq!(set.trust_point(&[3; 32]), None);
        let heights: Vec<_> = set.iter().map(|a| a.block.height).collect();
        assert_eq!(heights, vec![30, 20]);
    }

    #[test]
    fn quorum_by_first_root() {
        let a = vec![anchor(1, 100), anchor(2, 90)];
        let b = vec![anchor(3, 101)];
        let chosen = select_quorum([a.clone(), b.clone(), a.clone()]).unwrap();
        assert_eq!(chosen, a);

        // tie goes to the higher first anchor
        let chosen = select_quorum([a.clone(), b.clone()]).unwrap();
        assert_eq!(chosen, b);

        // empty responses do not vote
        assert!(select_quorum([vec![], vec![]]).is_none());
        assert!(select_quorum(Vec::<Vec<Anchor>>::new()).is_none());
    }

    #[test]
    fn anchor_json() {
        let json = format!(
            r#"[{{"root":"{}","block":{{"hash":"{}","height":870000}}}}]"#,
            "0a".repeat(32),
            "0B".repeat(32)
        );
        let anchors: Vec<Anchor> = serde_json::from_str(&json).unwrap();
        assert_eq!(anchors[0].root, [0x0a; 32]);
        assert_eq!(anchors[0].block.hash, [0x0b; 32]);
        assert_eq!(anchors[0].block.height, 870_000);

        let short = r#"[{"root":"abcd","block":{"hash":"abcd","height":1}}]"#;
        assert!(serde_json::from_str::<Vec<Anchor>>(short).is_err());
    }

    #[test]
    fn options_need_exactly_one_source() {
        let mut options = AnchorOptions::fixed(vec![]);
        assert_eq!(options.source_count(), 1);
        options.local_path = Some("anchors.json".into());
        assert_eq!(options.source_count(), 2);
        assert_eq!(AnchorOptions::remote([]).source_count(), 0);
    }
}
