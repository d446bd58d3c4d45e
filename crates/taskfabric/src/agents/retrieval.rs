//! Deterministic retrieval agent.
//!
//! Free text goes in, an envelope comes out. The pipeline: rule-based
//! filter extraction (LLM-assisted only when rules find nothing and a
//! provider exists), limit/offset normalization, a per-process result
//! cache, the read-only query, ordered filter reformulation on empty
//! results, and a rate-limited LLM fallback as the last resort. Empty
//! results are successful envelopes; the only errors that escape are
//! persistence failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::RetrievalSettings;
use crate::envelope::{
    CacheStatus, Envelope, FallbackKind, MetadataExtra, ReformulationAttempt, Row, Summary,
};
use crate::errors::AgentError;
use crate::llm::{ReasoningProvider, ReasoningRequest};
use crate::persistence::{Capabilities, FilterOp, FilterSet, QueryOptions, ReadOnlyFacade};
use crate::registry::TaskAgent;
use crate::stream::messages::TaskMessage;

/// Retrieval request accepted over the wire and via the direct API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrievalRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    /// Pre-parsed filters as a plain `column: value` map; wins over the
    /// prompt when present.
    #[serde(default)]
    pub filters: Option<Map<String, Value>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub include_raw: bool,
    /// Whether the caller wants structured output; gates the default-list
    /// policy.
    #[serde(default = "default_true", rename = "return_json")]
    pub structured: bool,
    #[serde(skip)]
    pub task_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RetrievalRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            structured: true,
            ..Default::default()
        }
    }
}

/// Filter fields the rule-based extractor understands.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct ParsedFilters {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

impl ParsedFilters {
    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.email.is_none()
            && self.company.is_none()
            && self.client_id.is_none()
    }
}

/// Sliding-window budget for the LLM fallback path.
struct FallbackBudget {
    max: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl FallbackBudget {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Take one slot if the rolling window has room.
    fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut stamps = self.stamps.lock();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        if stamps.len() < self.max {
            stamps.push_back(now);
            true
        } else {
            false
        }
    }
}

struct ExtractionRules {
    id: Regex,
    email: Regex,
    email_contains: Regex,
    company: Regex,
    client_id: Regex,
}

impl ExtractionRules {
    fn compile() -> Self {
        Self {
            id: Regex::new(r"(?i)\bid\s*[:=]?\s*([0-9A-Za-z\-]{2,})\b").expect("static regex"),
            email: Regex::new(r"([A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,})")
                .expect("static regex"),
            email_contains: Regex::new(r"(?i)\bemail\s+contains\s+(\S+)").expect("static regex"),
            company: Regex::new(r"(?i)(?:company|at|from)\s+([A-Za-z0-9][\w&.\- ]{1,60})")
                .expect("static regex"),
            client_id: Regex::new(r"(?i)\bclient[_ ]?id\s*[:=]?\s*([0-9A-Za-z\-]{2,})\b")
                .expect("static regex"),
        }
    }

    fn parse(&self, text: &str) -> ParsedFilters {
        let capture = |re: &Regex| {
            re.captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
        };
        let mut out = ParsedFilters {
            client_id: capture(&self.client_id),
            email: capture(&self.email),
            company: capture(&self.company),
            id: None,
        };
        // `client_id` wins over the bare-id rule for the same token.
        if out.client_id.is_none() {
            out.id = capture(&self.id);
        }
        // `email contains X` shapes a wildcard pattern.
        if out.email.is_none() {
            if let Some(fragment) = capture(&self.email_contains) {
                out.email = Some(format!("%{fragment}%"));
            }
        }
        out
    }
}

/// Shape parsed fields into the operator DSL, negotiating `ilike` support.
fn shape_filters(parsed: &ParsedFilters, caps: Capabilities) -> FilterSet {
    let mut filters = FilterSet::new();
    if let Some(id) = &parsed.id {
        filters.insert("id", FilterOp::Eq(Value::String(id.clone())));
    }
    if let Some(client_id) = &parsed.client_id {
        filters.insert("client_id", FilterOp::Eq(Value::String(client_id.clone())));
    }
    if let Some(email) = &parsed.email {
        let pattern = email.replace('*', "%");
        if pattern.contains('%') && caps.ilike {
            filters.insert("email", FilterOp::Ilike(pattern));
        } else {
            filters.insert("email", FilterOp::Eq(Value::String(email.clone())));
        }
    }
    if let Some(company) = &parsed.company {
        let pattern = company.replace('*', "%");
        if caps.ilike {
            let pattern = if pattern.contains('%') {
                pattern
            } else {
                format!("%{pattern}%")
            };
            filters.insert("company_name", FilterOp::Ilike(pattern));
        } else {
            filters.insert("company_name", FilterOp::Eq(Value::String(company.clone())));
        }
    }
    filters
}

/// Canonicalize a caller-supplied plain map into extractor fields.
/// Unrecognized keys are dropped, mirroring the deterministic coordinator's
/// whitelist.
fn parsed_from_map(map: &Map<String, Value>) -> ParsedFilters {
    let text = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    let mut out = ParsedFilters::default();
    for (key, value) in map {
        let Some(value) = text(value) else { continue };
        match key.as_str() {
            "id" => out.id = Some(value),
            "client_id" => out.client_id = Some(value),
            "email" => out.email = Some(value),
            "company" | "company_name" => out.company = Some(value),
            _ => {}
        }
    }
    out
}

/// Inner text of a company predicate, without ilike wildcards.
fn company_text(op: &FilterOp) -> Option<String> {
    match op {
        FilterOp::Ilike(pattern) => Some(pattern.trim_matches('%').to_string()),
        FilterOp::Eq(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Strip trailing corporate suffixes; `None` when nothing changed.
fn shorten_company(name: &str, suffixes: &[String]) -> Option<String> {
    let mut words: Vec<&str> = name.split_whitespace().collect();
    let mut changed = false;
    while let Some(last) = words.last() {
        let bare = last.trim_end_matches(',').to_lowercase();
        if words.len() > 1 && suffixes.iter().any(|s| *s == bare) {
            words.pop();
            changed = true;
        } else {
            break;
        }
    }
    if changed {
        Some(words.join(" "))
    } else {
        None
    }
}

/// Deterministic retrieval over the read-only persistence facade.
pub struct RetrievalAgent {
    facade: Arc<ReadOnlyFacade>,
    settings: RetrievalSettings,
    provider: Option<Arc<dyn ReasoningProvider>>,
    rules: ExtractionRules,
    cache: Mutex<HashMap<String, Envelope>>,
    budget: FallbackBudget,
}

impl RetrievalAgent {
    pub fn new(
        facade: Arc<ReadOnlyFacade>,
        settings: RetrievalSettings,
        provider: Option<Arc<dyn ReasoningProvider>>,
    ) -> Self {
        let budget = FallbackBudget::new(settings.max_fallbacks_per_min, Duration::from_secs(60));
        Self {
            facade,
            settings,
            provider,
            rules: ExtractionRules::compile(),
            cache: Mutex::new(HashMap::new()),
            budget,
        }
    }

    fn source(&self) -> String {
        format!("persistence.{}", self.settings.table)
    }

    fn cache_key(&self, filters: &FilterSet, limit: usize, offset: usize) -> String {
        let key = json!({
            "table": self.settings.table,
            "filters": filters.to_value(),
            "limit": limit,
            "offset": offset,
        });
        let digest = Sha256::digest(key.to_string().as_bytes());
        format!("{digest:x}")
    }

    async fn query_page(
        &self,
        filters: &FilterSet,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Row>, AgentError> {
        let options = QueryOptions::filtered(filters.clone())
            .with_limit(limit)
            .with_offset(offset);
        Ok(self.facade.query(&self.settings.table, &options).await?)
    }

    /// Ask the provider for structured extraction, with one bounded parse
    /// retry on malformed output.
    async fn llm_extract(&self, prompt: &str) -> Option<ParsedFilters> {
        let provider = self.provider.as_ref()?;
        let instruction = format!(
            "Extract lookup filters from the request below. Respond with ONLY a JSON \
             object using any of the keys \"id\", \"email\", \"company\", \"client_id\". \
             Omit keys that are not clearly present.\n\nRequest: {prompt}"
        );
        for attempt in 0..2 {
            let request = ReasoningRequest::deterministic(&instruction)
                .with_system("You convert requests into JSON filters. Output JSON only.");
            let response = match provider.complete(request).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(target: "taskfabric::retrieval", error = %e, "filter extraction failed");
                    return None;
                }
            };
            if let Some(parsed) = extract_json_object(&response.text) {
                if let Ok(filters) = serde_json::from_value::<ParsedFilters>(parsed) {
                    if !filters.is_empty() {
                        return Some(filters);
                    }
                }
            }
            tracing::debug!(
                target: "taskfabric::retrieval",
                attempt,
                "extraction output was not parseable JSON"
            );
        }
        None
    }

    /// Ordered relaxation strategies; stops at the first non-empty result.
    /// A strategy that would leave the filter set empty is skipped: fully
    /// unfiltered listing is the default-list policy's job, not
    /// reformulation's.
    async fn reformulate(
        &self,
        filters: &FilterSet,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Row>, FilterSet, Vec<ReformulationAttempt>), AgentError> {
        let mut current = filters.clone();
        let mut attempts: Vec<ReformulationAttempt> = Vec::new();

        let strategies: [(&str, fn(&RetrievalAgent, &FilterSet) -> Option<FilterSet>); 3] = [
            ("drop_email", |_, f| {
                let mut next = f.clone();
                next.remove("email")?;
                Some(next)
            }),
            ("shorten_company", |agent, f| {
                let op = f.get("company_name")?;
                let text = company_text(op)?;
                let shorter = shorten_company(&text, &agent.settings.company_suffixes)?;
                let mut next = f.clone();
                next.insert("company_name", FilterOp::Ilike(format!("%{shorter}%")));
                Some(next)
            }),
            ("drop_company", |_, f| {
                let mut next = f.clone();
                next.remove("company_name")?;
                Some(next)
            }),
        ];

        for (reason, strategy) in strategies {
            if attempts.len() >= self.settings.reformulation_max_attempts {
                break;
            }
            let Some(next) = strategy(self, &current) else {
                continue;
            };
            if next.is_empty() {
                continue;
            }
            let rows = self.query_page(&next, limit, offset).await?;
            attempts.push(ReformulationAttempt {
                reason: reason.to_string(),
                filters: next.to_value(),
                result_count: rows.len(),
            });
            if !rows.is_empty() {
                return Ok((rows, next, attempts));
            }
            current = next;
        }
        Ok((Vec::new(), current, attempts))
    }

    /// Last resort once deterministic retrieval came up empty.
    async fn fallback(
        &self,
        request: &RetrievalRequest,
        filters: &FilterSet,
        limit: usize,
        offset: usize,
        attempts: Vec<ReformulationAttempt>,
    ) -> Envelope {
        let attempts = (!attempts.is_empty()).then_some(attempts);
        let base_extra = |fallback: Option<FallbackKind>| MetadataExtra {
            query_filters: (!filters.is_empty()).then(|| filters.to_value()),
            limit: Some(limit),
            offset: Some(offset),
            fallback,
            reformulation_attempts: attempts.clone(),
            ..Default::default()
        };

        let (Some(provider), Some(prompt)) = (&self.provider, request.prompt.as_deref()) else {
            return Envelope::from_records(
                &self.source(),
                vec![],
                request.task_id.as_deref(),
                base_extra(None),
            );
        };

        if !self.budget.try_acquire() {
            return Envelope::from_records(
                &self.source(),
                vec![],
                request.task_id.as_deref(),
                base_extra(Some(FallbackKind::Suppressed)),
            );
        }

        let reasoning = ReasoningRequest::deterministic(format!(
            "Deterministic lookup over the '{}' table found no rows for this request. \
             Available tools were equality and pattern filters on id, email, \
             company_name, and client_id. Answer the request directly instead.\n\n\
             Request: {prompt}",
            self.settings.table
        ))
        .with_system("You are the reasoning fallback of a retrieval service.");

        match provider.complete(reasoning).await {
            Ok(response) => {
                let mut row = Row::new();
                row.insert("response".into(), Value::String(response.text));
                Envelope::from_records(
                    "agent",
                    vec![row],
                    request.task_id.as_deref(),
                    MetadataExtra {
                        query_filters: (!filters.is_empty()).then(|| filters.to_value()),
                        limit: Some(limit),
                        offset: Some(offset),
                        fallback: Some(FallbackKind::Agent),
                        reformulation_attempts: attempts.clone(),
                        ..Default::default()
                    },
                )
            }
            Err(e) => {
                tracing::warn!(target: "taskfabric::retrieval", error = %e, "reasoning fallback failed");
                Envelope::from_records(
                    &self.source(),
                    vec![],
                    request.task_id.as_deref(),
                    base_extra(None),
                )
            }
        }
    }

    /// Attach a summary and truncate when the result set is oversized.
    fn summarize(&self, rows: Vec<Row>) -> (Vec<Row>, Option<Summary>, Option<usize>) {
        if rows.len() <= self.settings.summary_threshold {
            return (rows, None, None);
        }
        let total = rows.len();
        let group_by = self.settings.summary_group_column.clone();
        let mut counts = std::collections::BTreeMap::new();
        for row in &rows {
            let key = match row.get(group_by.as_str()) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "(none)".to_string(),
            };
            *counts.entry(key).or_insert(0usize) += 1;
        }
        let mut truncated = rows;
        truncated.truncate(self.settings.summary_threshold);
        (truncated, Some(Summary { group_by, counts }), Some(total))
    }

    /// Execute the full retrieval pipeline.
    pub async fn run(&self, request: RetrievalRequest) -> Result<Envelope, AgentError> {
        let caps = self.facade.capabilities();

        // Parse: explicit filters win, then prompt rules, then the LLM.
        let mut parsed = match &request.filters {
            Some(map) if !map.is_empty() => parsed_from_map(map),
            _ => request
                .prompt
                .as_deref()
                .map(|p| self.rules.parse(p))
                .unwrap_or_default(),
        };
        if parsed.is_empty() {
            if let Some(prompt) = request.prompt.as_deref() {
                if let Some(extracted) = self.llm_extract(prompt).await {
                    parsed = extracted;
                }
            }
        }

        // Normalize.
        let limit = request
            .limit
            .unwrap_or(self.settings.default_limit)
            .clamp(1, self.settings.max_limit);
        let offset = request.offset.unwrap_or(0);
        let filters = shape_filters(&parsed, caps);

        // Nothing to filter on: safe default page or fallback.
        if filters.is_empty() {
            if request.structured && self.settings.default_list_on_empty {
                let rows = self
                    .query_page(&FilterSet::new(), self.settings.default_limit, 0)
                    .await?;
                return Ok(Envelope::from_records(
                    &self.source(),
                    rows,
                    request.task_id.as_deref(),
                    MetadataExtra {
                        limit: Some(self.settings.default_limit),
                        offset: Some(0),
                        include_raw: request.include_raw,
                        ..Default::default()
                    },
                ));
            }
            return Ok(self
                .fallback(&request, &filters, limit, offset, Vec::new())
                .await);
        }

        // Cache lookup.
        let cache_key = self.cache_key(&filters, limit, offset);
        if !self.settings.cache_disabled {
            if let Some(mut hit) = self.cache.lock().get(&cache_key).cloned() {
                hit.metadata.cache = Some(CacheStatus::Hit);
                hit.metadata.task_id = request.task_id.clone();
                return Ok(hit);
            }
        }

        // Query, then relax on empty.
        let mut rows = self.query_page(&filters, limit, offset).await?;
        let mut effective_filters = filters.clone();
        let mut attempts: Vec<ReformulationAttempt> = Vec::new();
        let mut via_reformulation = false;
        if rows.is_empty() {
            let (relaxed_rows, relaxed_filters, tried) =
                self.reformulate(&filters, limit, offset).await?;
            attempts = tried;
            if !relaxed_rows.is_empty() {
                rows = relaxed_rows;
                effective_filters = relaxed_filters;
                via_reformulation = true;
            }
        }

        if rows.is_empty() {
            return Ok(self
                .fallback(&request, &filters, limit, offset, attempts)
                .await);
        }

        let (rows, summary, total_override) = self.summarize(rows);
        let envelope = Envelope::from_records(
            &self.source(),
            rows,
            request.task_id.as_deref(),
            MetadataExtra {
                query_filters: Some(effective_filters.to_value()),
                limit: Some(limit),
                offset: Some(offset),
                cache: Some(CacheStatus::Miss),
                fallback: via_reformulation.then_some(FallbackKind::Reformulation),
                summary,
                total_count_override: total_override,
                reformulation_attempts: (!attempts.is_empty()).then_some(attempts),
                include_raw: request.include_raw,
            },
        );

        if !self.settings.cache_disabled {
            // Last write wins; concurrent identical queries may both miss.
            self.cache.lock().insert(cache_key, envelope.clone());
        }
        Ok(envelope)
    }
}

/// First `{ … }` block in a provider response, parsed as JSON.
fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[async_trait]
impl TaskAgent for RetrievalAgent {
    fn name(&self) -> &str {
        "retrieval"
    }

    async fn handle(&self, task: &TaskMessage) -> Result<Envelope, AgentError> {
        let mut request: RetrievalRequest = serde_json::from_value(task.payload.clone())
            .map_err(|e| AgentError::validation(format!("malformed retrieval payload: {e}")))?;
        request.task_id = Some(task.task_id.clone());
        self.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistSettings;
    use crate::envelope::EnvelopeStatus;
    use crate::llm::{ReasoningError, ReasoningResponse};
    use crate::persistence::metrics::MetricsRegistry;
    use crate::persistence::{read_only_service, InMemoryAdapter, PersistenceAdapter, PersistenceService};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn seeded_facade(rows: Vec<Row>) -> Arc<ReadOnlyFacade> {
        let adapter = Arc::new(InMemoryAdapter::new());
        let persist = PersistSettings::default();
        let writer = PersistenceService::new(
            adapter.clone(),
            persist.read_tables.iter().cloned(),
            ["leads".to_string()],
            MetricsRegistry::new(),
        );
        for row in rows {
            writer.write("leads", row).await.unwrap();
        }
        Arc::new(ReadOnlyFacade::over(Arc::new(read_only_service(
            adapter,
            persist.read_tables.iter().cloned(),
            MetricsRegistry::new(),
        ))))
    }

    fn agent_with(
        facade: Arc<ReadOnlyFacade>,
        settings: RetrievalSettings,
        provider: Option<Arc<dyn ReasoningProvider>>,
    ) -> RetrievalAgent {
        RetrievalAgent::new(facade, settings, provider)
    }

    /// Provider that returns a canned response and counts invocations.
    struct ScriptedProvider {
        response: String,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(response: &str) -> Self {
            Self {
                response: response.into(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ReasoningProvider for ScriptedProvider {
        async fn complete(
            &self,
            _request: ReasoningRequest,
        ) -> Result<ReasoningResponse, ReasoningError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReasoningResponse {
                text: self.response.clone(),
                model: Some("scripted".into()),
            })
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    // -- parsing --

    #[test]
    fn parses_email_id_company_and_client_id() {
        let rules = ExtractionRules::compile();

        let parsed = rules.parse("find leads a@x.io at Acme");
        assert_eq!(parsed.email.as_deref(), Some("a@x.io"));
        assert_eq!(parsed.company.as_deref(), Some("Acme"));

        let parsed = rules.parse("id: 42-abc please");
        assert_eq!(parsed.id.as_deref(), Some("42-abc"));

        let parsed = rules.parse("client_id c1 leads");
        assert_eq!(parsed.client_id.as_deref(), Some("c1"));
        assert_eq!(parsed.id, None, "client_id must not trigger the id rule");

        let parsed = rules.parse("email contains test.io");
        assert_eq!(parsed.email.as_deref(), Some("%test.io%"));

        assert!(rules.parse("hello there").is_empty());
    }

    #[test]
    fn shape_negotiates_ilike_against_capabilities() {
        let parsed = ParsedFilters {
            company: Some("Acme".into()),
            email: Some("%x.io%".into()),
            ..Default::default()
        };
        let mut caps = InMemoryAdapter::new().capabilities();

        let shaped = shape_filters(&parsed, caps);
        assert_eq!(
            shaped.get("company_name"),
            Some(&FilterOp::Ilike("%Acme%".into()))
        );
        assert_eq!(shaped.get("email"), Some(&FilterOp::Ilike("%x.io%".into())));

        caps.ilike = false;
        let shaped = shape_filters(&parsed, caps);
        assert_eq!(
            shaped.get("company_name"),
            Some(&FilterOp::Eq(json!("Acme")))
        );
        assert_eq!(shaped.get("email"), Some(&FilterOp::Eq(json!("%x.io%"))));
    }

    #[test]
    fn company_suffix_stripping() {
        let suffixes = RetrievalSettings::default().company_suffixes;
        assert_eq!(shorten_company("Beta LLC", &suffixes).as_deref(), Some("Beta"));
        assert_eq!(
            shorten_company("Acme Holdings Inc.", &suffixes).as_deref(),
            Some("Acme Holdings")
        );
        assert_eq!(shorten_company("Acme", &suffixes), None);
        // A company that IS a suffix word is left alone.
        assert_eq!(shorten_company("Ltd", &suffixes), None);
    }

    // -- pipeline --

    #[tokio::test]
    async fn happy_path_prompt_to_envelope() {
        let facade = seeded_facade(vec![row(&[
            ("email", json!("a@x.io")),
            ("company_name", json!("Acme")),
        ])])
        .await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);

        let env = agent
            .run(RetrievalRequest::from_prompt("find leads at acme"))
            .await
            .unwrap();
        assert_eq!(env.status, EnvelopeStatus::Success);
        assert_eq!(env.metadata.source, "persistence.leads");
        assert_eq!(env.metadata.total_count, 1);
        assert_eq!(env.records[0].fields["email"], json!("a@x.io"));
        assert!(env.records[0].provenance.row_hash.len() == 64);
        assert_eq!(
            env.metadata.query_filters.as_ref().unwrap()["company_name"],
            json!({"ilike": "%acme%"})
        );
        env.validate().unwrap();
    }

    #[tokio::test]
    async fn limit_is_clamped_to_the_configured_maximum() {
        let rows: Vec<Row> = (0..20)
            .map(|i| row(&[("email", json!(format!("u{i}@x.io"))), ("company_name", json!("Acme"))]))
            .collect();
        let facade = seeded_facade(rows).await;
        let settings = RetrievalSettings {
            max_limit: 10,
            ..Default::default()
        };
        let agent = agent_with(facade, settings, None);

        let mut request = RetrievalRequest::from_prompt("find leads at Acme");
        request.limit = Some(999_999);
        let env = agent.run(request).await.unwrap();
        assert_eq!(env.metadata.limit, Some(10));
        assert!(env.metadata.total_count <= 10);

        // Zero is clamped up, never panics.
        let mut request = RetrievalRequest::from_prompt("find leads at Acme");
        request.limit = Some(0);
        let env = agent.run(request).await.unwrap();
        assert_eq!(env.metadata.limit, Some(1));
    }

    #[tokio::test]
    async fn pagination_pages_are_disjoint() {
        let rows: Vec<Row> = (0..6)
            .map(|i| row(&[("email", json!(format!("u{i}@x.io"))), ("company_name", json!("Acme"))]))
            .collect();
        let facade = seeded_facade(rows).await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);

        let mut first = RetrievalRequest::from_prompt("find leads at Acme");
        first.limit = Some(3);
        first.offset = Some(0);
        let mut second = RetrievalRequest::from_prompt("find leads at Acme");
        second.limit = Some(3);
        second.offset = Some(3);

        let env1 = agent.run(first).await.unwrap();
        let env2 = agent.run(second).await.unwrap();
        let ids1: Vec<_> = env1.records.iter().filter_map(|r| r.provenance.row_id.clone()).collect();
        let ids2: Vec<_> = env2.records.iter().filter_map(|r| r.provenance.row_id.clone()).collect();
        assert_eq!(ids1.len(), 3);
        assert_eq!(ids2.len(), 3);
        assert!(ids1.iter().all(|id| !ids2.contains(id)));
    }

    #[tokio::test]
    async fn second_identical_query_is_a_cache_hit() {
        let facade = seeded_facade(vec![row(&[
            ("email", json!("a@x.io")),
            ("company_name", json!("Acme")),
        ])])
        .await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);

        let env1 = agent
            .run(RetrievalRequest::from_prompt("find leads at Acme"))
            .await
            .unwrap();
        assert_eq!(env1.metadata.cache, Some(CacheStatus::Miss));

        let env2 = agent
            .run(RetrievalRequest::from_prompt("find leads at Acme"))
            .await
            .unwrap();
        assert_eq!(env2.metadata.cache, Some(CacheStatus::Hit));
        assert_eq!(env2.metadata.total_count, 1);
    }

    #[tokio::test]
    async fn cache_can_be_disabled() {
        let facade = seeded_facade(vec![row(&[("company_name", json!("Acme"))])]).await;
        let settings = RetrievalSettings {
            cache_disabled: true,
            ..Default::default()
        };
        let agent = agent_with(facade, settings, None);

        agent
            .run(RetrievalRequest::from_prompt("find leads at Acme"))
            .await
            .unwrap();
        let env = agent
            .run(RetrievalRequest::from_prompt("find leads at Acme"))
            .await
            .unwrap();
        assert_eq!(env.metadata.cache, Some(CacheStatus::Miss));
    }

    #[tokio::test]
    async fn reformulation_drops_email_first_and_stops_on_success() {
        let facade = seeded_facade(vec![row(&[
            ("email", json!("a@x.io")),
            ("company_name", json!("Acme Inc")),
        ])])
        .await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);

        let mut request = RetrievalRequest::default();
        request.structured = true;
        request.filters = Some(
            [
                ("email".to_string(), json!("b@x.io")),
                ("company".to_string(), json!("Acme Inc")),
            ]
            .into_iter()
            .collect(),
        );

        let env = agent.run(request).await.unwrap();
        assert_eq!(env.metadata.total_count, 1);
        assert_eq!(env.metadata.fallback, Some(FallbackKind::Reformulation));

        let attempts = env.metadata.reformulation_attempts.as_ref().unwrap();
        assert_eq!(attempts.len(), 1, "stop on first non-empty result");
        assert_eq!(attempts[0].reason, "drop_email");
        assert_eq!(attempts[0].result_count, 1);
        assert!(attempts[0].filters.get("email").is_none());
    }

    #[tokio::test]
    async fn reformulation_shortens_company_suffixes() {
        let facade = seeded_facade(vec![row(&[("company_name", json!("Beta"))])]).await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);

        let env = agent
            .run(RetrievalRequest::from_prompt("find leads at Beta LLC"))
            .await
            .unwrap();
        assert_eq!(env.metadata.total_count, 1);
        let attempts = env.metadata.reformulation_attempts.as_ref().unwrap();
        assert_eq!(attempts[0].reason, "shorten_company");
        assert_eq!(
            attempts[0].filters["company_name"],
            json!({"ilike": "%Beta%"})
        );
    }

    #[tokio::test]
    async fn reformulation_attempts_are_bounded() {
        let facade = seeded_facade(vec![row(&[("company_name", json!("Unrelated"))])]).await;
        let settings = RetrievalSettings {
            reformulation_max_attempts: 1,
            ..Default::default()
        };
        let agent = agent_with(facade, settings, None);

        let mut request = RetrievalRequest::default();
        request.structured = true;
        request.filters = Some(
            [
                ("email".to_string(), json!("none@x.io")),
                ("company".to_string(), json!("Ghost Corp")),
            ]
            .into_iter()
            .collect(),
        );
        let env = agent.run(request).await.unwrap();
        assert_eq!(env.metadata.total_count, 0);
        let attempts = env.metadata.reformulation_attempts.as_ref().unwrap();
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn lone_company_filter_is_not_dropped_to_an_unfiltered_scan() {
        let facade = seeded_facade(vec![row(&[("company_name", json!("Acme"))])]).await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);

        let env = agent
            .run(RetrievalRequest::from_prompt("find leads at NoSuchCompany"))
            .await
            .unwrap();
        // drop_company would leave an empty filter set; it must be skipped.
        assert_eq!(env.metadata.total_count, 0);
        assert!(env
            .metadata
            .reformulation_attempts
            .as_ref()
            .map(|a| a.iter().all(|at| at.reason != "drop_company"))
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn default_list_serves_a_safe_page_without_the_provider() {
        let facade = seeded_facade(vec![
            row(&[("email", json!("a@x.io"))]),
            row(&[("email", json!("b@x.io"))]),
            row(&[("email", json!("c@x.io"))]),
        ])
        .await;
        let settings = RetrievalSettings {
            default_list_on_empty: true,
            ..Default::default()
        };
        let provider = Arc::new(ScriptedProvider::new("should not be called"));
        let agent = agent_with(facade, settings, Some(provider.clone()));

        let env = agent.run(RetrievalRequest::from_prompt("hello")).await.unwrap();
        assert_eq!(env.metadata.total_count, 3);
        assert_eq!(env.metadata.fallback, None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0, "no LLM call");
    }

    #[tokio::test]
    async fn fallback_invokes_the_provider_and_tags_the_envelope() {
        let facade = seeded_facade(vec![]).await;
        let provider = Arc::new(ScriptedProvider::new("Nothing on file for that company."));
        let agent = agent_with(facade, RetrievalSettings::default(), Some(provider.clone()));

        let env = agent
            .run(RetrievalRequest::from_prompt("find leads at GhostCorp"))
            .await
            .unwrap();
        assert_eq!(env.metadata.fallback, Some(FallbackKind::Agent));
        assert_eq!(env.metadata.source, "agent");
        assert_eq!(env.metadata.total_count, 1);
        assert_eq!(
            env.records[0].fields["response"],
            json!("Nothing on file for that company.")
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_suppresses_the_fallback_without_error() {
        let facade = seeded_facade(vec![]).await;
        let provider = Arc::new(ScriptedProvider::new("answer"));
        let settings = RetrievalSettings {
            max_fallbacks_per_min: 1,
            cache_disabled: true,
            ..Default::default()
        };
        let agent = agent_with(facade, settings, Some(provider.clone()));

        let first = agent
            .run(RetrievalRequest::from_prompt("find leads at GhostCorp"))
            .await
            .unwrap();
        assert_eq!(first.metadata.fallback, Some(FallbackKind::Agent));

        let second = agent
            .run(RetrievalRequest::from_prompt("find leads at OtherGhost"))
            .await
            .unwrap();
        assert_eq!(second.metadata.fallback, Some(FallbackKind::Suppressed));
        assert_eq!(second.metadata.total_count, 0);
        assert_eq!(second.status, EnvelopeStatus::Success);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_provider_means_structured_only_empty_envelope() {
        let facade = seeded_facade(vec![]).await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);
        let env = agent
            .run(RetrievalRequest::from_prompt("find leads at GhostCorp"))
            .await
            .unwrap();
        assert_eq!(env.metadata.total_count, 0);
        assert_eq!(env.metadata.fallback, None);
        assert_eq!(env.status, EnvelopeStatus::Success);
    }

    #[tokio::test]
    async fn oversized_results_truncate_with_summary() {
        let rows: Vec<Row> = (0..8)
            .map(|i| {
                row(&[
                    ("email", json!(format!("u{i}@x.io"))),
                    ("company_name", json!(if i % 2 == 0 { "Acme" } else { "Beta" })),
                ])
            })
            .collect();
        let facade = seeded_facade(rows).await;
        let settings = RetrievalSettings {
            summary_threshold: 5,
            ..Default::default()
        };
        let agent = agent_with(facade, settings, None);

        let mut request = RetrievalRequest::from_prompt("email contains x.io");
        request.limit = Some(8);
        let env = agent.run(request).await.unwrap();

        assert_eq!(env.metadata.total_count, 8, "pre-truncation count");
        assert_eq!(env.records.len(), 5);
        assert_eq!(env.metadata.truncated, Some(true));
        let summary = env.metadata.summary.as_ref().unwrap();
        assert_eq!(summary.group_by, "company_name");
        assert_eq!(summary.counts["Acme"], 4);
        assert_eq!(summary.counts["Beta"], 4);
        env.validate().unwrap();
    }

    #[tokio::test]
    async fn include_raw_propagates_to_provenance() {
        let facade = seeded_facade(vec![row(&[("company_name", json!("Acme"))])]).await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);
        let mut request = RetrievalRequest::from_prompt("find leads at Acme");
        request.include_raw = true;
        let env = agent.run(request).await.unwrap();
        assert!(env.records[0].provenance.raw_row.is_some());
    }

    #[tokio::test]
    async fn llm_extraction_kicks_in_when_rules_find_nothing() {
        let facade = seeded_facade(vec![row(&[("company_name", json!("Acme"))])]).await;
        let provider = Arc::new(ScriptedProvider::new(r#"{"company": "Acme"}"#));
        let agent = agent_with(facade, RetrievalSettings::default(), Some(provider.clone()));

        let env = agent
            .run(RetrievalRequest::from_prompt("who do we know over there"))
            .await
            .unwrap();
        assert_eq!(env.metadata.total_count, 1);
        assert_eq!(env.metadata.fallback, None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn budget_window_slides() {
        let budget = FallbackBudget::new(2, Duration::from_millis(30));
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        std::thread::sleep(Duration::from_millis(40));
        assert!(budget.try_acquire());
    }

    #[test]
    fn json_extraction_tolerates_prose() {
        let value =
            extract_json_object("Sure! Here you go: {\"email\": \"a@x.io\"} hope that helps")
                .unwrap();
        assert_eq!(value["email"], json!("a@x.io"));
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }

    #[tokio::test]
    async fn handle_threads_the_task_id_through() {
        let facade = seeded_facade(vec![row(&[("company_name", json!("Acme"))])]).await;
        let agent = agent_with(facade, RetrievalSettings::default(), None);
        let task = TaskMessage::new(
            "rag.query",
            json!({"prompt": "find leads at Acme", "limit": 5}),
        );
        let env = agent.handle(&task).await.unwrap();
        assert_eq!(env.metadata.task_id.as_deref(), Some(task.task_id.as_str()));
        assert_eq!(env.metadata.total_count, 1);
    }
}
