//! # Transition Response Generator
//!
//! Produces the short filler played while tools run. Tiers, first hit wins:
//!
//! 1. rule map (exact tool name, then fuzzy containment)
//! 2. template `"{action}{target}"` from the tool name tokens and arguments
//! 3. model completion, disabled by default
//!
//! Results are memoized in a bounded moka cache keyed by tool name, category
//! and an xxh3 hash of the arguments.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache as MokaCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_128;

use crate::core::llm::LanguageModel;
use crate::core::tools::{ToolArg, ToolArgs, args_to_json};

pub const DEFAULT_TRANSITION: &str = "好的，请稍等";

const LLM_FALLBACK_TIMEOUT: Duration = Duration::from_millis(1500);
const MAX_LLM_REPLY_CHARS: usize = 20;

const RULES: &[(&str, &str)] = &[
    ("get_weather", "正在查询天气"),
    ("play_music", "正在为您准备音乐"),
    ("get_news", "正在获取最新新闻"),
    ("get_time", "正在查看时间"),
    ("get_date", "正在查看日期"),
    ("set_volume", "正在调节音量"),
    ("set_reminder", "正在设置提醒"),
    ("search_web", "正在搜索相关信息"),
    ("get_stock", "正在查询股票行情"),
    ("query_order", "正在查询订单"),
];

/// Category keywords, checked in order.
const CATEGORIES: &[(&str, &[&str])] = &[
    ("payment", &["pay", "payment", "charge", "refund", "bill"]),
    ("order", &["order", "purchase", "cart"]),
    ("iot", &["iot", "device", "light", "lamp", "switch", "speaker", "volume", "air", "curtain"]),
    ("media", &["music", "song", "play", "video", "radio", "podcast"]),
    ("medical", &["medical", "doctor", "hospital", "medicine", "health", "symptom"]),
    ("meeting", &["meeting", "schedule", "calendar", "appointment", "book"]),
    ("sales", &["sales", "product", "price", "quote", "discount"]),
    ("task", &["task", "todo", "remind", "reminder", "note"]),
    ("user", &["user", "account", "profile", "member"]),
    ("query", &["get", "query", "search", "check", "find", "lookup", "fetch"]),
];

const VERBS: &[(&str, &str)] = &[
    ("get", "正在查询"),
    ("query", "正在查询"),
    ("search", "正在搜索"),
    ("check", "正在检查"),
    ("find", "正在查找"),
    ("lookup", "正在查询"),
    ("fetch", "正在获取"),
    ("play", "正在播放"),
    ("set", "正在设置"),
    ("update", "正在更新"),
    ("create", "正在创建"),
    ("add", "正在添加"),
    ("book", "正在预订"),
    ("cancel", "正在取消"),
    ("delete", "正在删除"),
    ("remove", "正在删除"),
    ("send", "正在发送"),
    ("pay", "正在支付"),
    ("open", "正在打开"),
    ("close", "正在关闭"),
    ("turn", "正在操作"),
];

const NOUNS: &[(&str, &str)] = &[
    ("weather", "天气"),
    ("music", "音乐"),
    ("song", "歌曲"),
    ("news", "新闻"),
    ("time", "时间"),
    ("date", "日期"),
    ("order", "订单"),
    ("payment", "支付信息"),
    ("user", "用户信息"),
    ("account", "账户"),
    ("profile", "个人资料"),
    ("light", "灯光"),
    ("volume", "音量"),
    ("meeting", "会议"),
    ("schedule", "日程"),
    ("calendar", "日程"),
    ("appointment", "预约"),
    ("reminder", "提醒"),
    ("task", "任务"),
    ("product", "商品"),
    ("price", "价格"),
    ("doctor", "医生"),
    ("stock", "股票"),
    ("express", "快递"),
    ("delivery", "快递"),
    ("video", "视频"),
    ("email", "邮件"),
    ("message", "消息"),
];

fn category_action(category: &str) -> &'static str {
    match category {
        "payment" | "order" | "task" => "正在处理",
        "iot" => "正在控制",
        "media" => "正在准备",
        "meeting" => "正在安排",
        "user" => "正在获取",
        _ => "正在查询",
    }
}

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn tokens(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keyword category of a tool name; `"other"` when nothing matches.
pub fn categorize(name: &str) -> &'static str {
    let tokens = tokens(name);
    CATEGORIES
        .iter()
        .find(|(_, keywords)| tokens.iter().any(|t| keywords.contains(&t.as_str())))
        .map(|(category, _)| *category)
        .unwrap_or("other")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionSource {
    Cache,
    Rule,
    Template,
    Llm,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    pub llm_fallback: bool,
    pub cache_size: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            llm_fallback: false,
            cache_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransitionStats {
    pub cache_hits: u64,
    pub rule_hits: u64,
    pub template_hits: u64,
    pub llm_hits: u64,
    pub defaults: u64,
}

#[derive(Default)]
struct Counters {
    cache: AtomicU64,
    rule: AtomicU64,
    template: AtomicU64,
    llm: AtomicU64,
    default: AtomicU64,
}

pub struct TransitionGenerator {
    config: TransitionConfig,
    cache: MokaCache<String, (String, TransitionSource)>,
    llm: Option<Arc<dyn LanguageModel>>,
    counters: Counters,
}

impl TransitionGenerator {
    pub fn new(config: TransitionConfig) -> Self {
        Self {
            cache: MokaCache::new(config.cache_size),
            config,
            llm: None,
            counters: Counters::default(),
        }
    }

    /// Model used by the third tier when `llm_fallback` is on.
    pub fn with_llm(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub async fn generate(&self, name: &str, args: &ToolArgs) -> String {
        self.generate_with_source(name, args).await.0
    }

    /// Generate and report which tier produced the utterance.
    pub async fn generate_with_source(&self, name: &str, args: &ToolArgs) -> (String, TransitionSource) {
        let category = categorize(name);
        let key = cache_key(name, category, args);
        if let Some((text, _)) = self.cache.get(&key).await {
            self.counters.cache.fetch_add(1, Ordering::Relaxed);
            return (text, TransitionSource::Cache);
        }

        let (text, source) = self.produce(name, category, args).await;
        debug!("Transition for {} via {:?}: {}", name, source, text);
        self.cache.insert(key, (text.clone(), source)).await;
        (text, source)
    }

    async fn produce(&self, name: &str, category: &str, args: &ToolArgs) -> (String, TransitionSource) {
        if let Some(text) = rule_match(name) {
            self.counters.rule.fetch_add(1, Ordering::Relaxed);
            return (text.to_string(), TransitionSource::Rule);
        }
        if let Some(text) = render_template(name, category, args) {
            self.counters.template.fetch_add(1, Ordering::Relaxed);
            return (text, TransitionSource::Template);
        }
        if self.config.llm_fallback
            && let Some(text) = self.llm_fallback(name).await
        {
            self.counters.llm.fetch_add(1, Ordering::Relaxed);
            return (text, TransitionSource::Llm);
        }
        self.counters.default.fetch_add(1, Ordering::Relaxed);
        (DEFAULT_TRANSITION.to_string(), TransitionSource::Default)
    }

    async fn llm_fallback(&self, name: &str) -> Option<String> {
        let llm = self.llm.as_ref()?;
        let prompt = format!(
            "用户请求正在通过工具 {} 处理。请用一句不超过十个字的中文告诉用户你正在处理，只输出这句话。",
            name
        );
        match tokio::time::timeout(LLM_FALLBACK_TIMEOUT, llm.complete(&prompt)).await {
            Ok(Ok(text)) => {
                let line = text.lines().next().unwrap_or_default().trim();
                if line.is_empty() {
                    None
                } else {
                    Some(line.chars().take(MAX_LLM_REPLY_CHARS).collect())
                }
            }
            Ok(Err(e)) => {
                warn!("Transition model fallback failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Transition model fallback timed out");
                None
            }
        }
    }

    pub fn stats(&self) -> TransitionStats {
        TransitionStats {
            cache_hits: self.counters.cache.load(Ordering::Relaxed),
            rule_hits: self.counters.rule.load(Ordering::Relaxed),
            template_hits: self.counters.template.load(Ordering::Relaxed),
            llm_hits: self.counters.llm.load(Ordering::Relaxed),
            defaults: self.counters.default.load(Ordering::Relaxed),
        }
    }
}

fn cache_key(name: &str, category: &str, args: &ToolArgs) -> String {
    let args = args_to_json(args).to_string();
    format!("{}|{}|{:032x}", name, category, xxh3_128(args.as_bytes()))
}

fn rule_match(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    if let Some(text) = lookup(RULES, &lower) {
        return Some(text);
    }
    RULES
        .iter()
        .find(|(rule, _)| lower.contains(rule) || (lower.len() > 3 && rule.contains(lower.as_str())))
        .map(|(_, text)| *text)
}

fn render_template(name: &str, category: &str, args: &ToolArgs) -> Option<String> {
    let tokens = tokens(name);
    let action = tokens
        .iter()
        .find_map(|t| lookup(VERBS, t))
        .or_else(|| (category != "other").then(|| category_action(category)))?;
    let target = tokens
        .iter()
        .find_map(|t| lookup(NOUNS, t).map(str::to_string))
        .or_else(|| argument_target(args))
        .unwrap_or_else(|| "相关信息".to_string());
    Some(format!("{}{}", action, target))
}

/// A short string argument can stand in for the target ("北京").
fn argument_target(args: &ToolArgs) -> Option<String> {
    args.values().find_map(|v| match v {
        ToolArg::Text(s) if !s.trim().is_empty() && s.chars().count() <= 8 => Some(s.trim().to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dialogue::DialogueTurn;
    use crate::core::llm::{FunctionSpec, LlmChunk, LlmResult, LlmStream};
    use async_trait::async_trait;
    use futures::StreamExt;

    fn args(pairs: &[(&str, &str)]) -> ToolArgs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ToolArg::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn test_rule_tier() {
        let generator = TransitionGenerator::new(TransitionConfig::default());
        let (text, source) = generator
            .generate_with_source("get_weather", &args(&[("city", "北京")]))
            .await;
        assert_eq!(text, "正在查询天气");
        assert_eq!(source, TransitionSource::Rule);
    }

    #[tokio::test]
    async fn test_fuzzy_rule() {
        let generator = TransitionGenerator::new(TransitionConfig::default());
        let (text, source) = generator
            .generate_with_source("plugin_get_weather_v2", &ToolArgs::new())
            .await;
        assert_eq!(text, "正在查询天气");
        assert_eq!(source, TransitionSource::Rule);
    }

    #[tokio::test]
    async fn test_template_tier() {
        let generator = TransitionGenerator::new(TransitionConfig::default());
        let (text, source) = generator
            .generate_with_source("check_express_status", &ToolArgs::new())
            .await;
        assert_eq!(text, "正在检查快递");
        assert_eq!(source, TransitionSource::Template);

        let (text, _) = generator
            .generate_with_source("lookup_city_info", &args(&[("city", "上海")]))
            .await;
        assert_eq!(text, "正在查询上海");
    }

    #[tokio::test]
    async fn test_default_is_never_empty() {
        let generator = TransitionGenerator::new(TransitionConfig::default());
        let (text, source) = generator.generate_with_source("xyzzy", &ToolArgs::new()).await;
        assert_eq!(text, DEFAULT_TRANSITION);
        assert_eq!(source, TransitionSource::Default);
    }

    #[tokio::test]
    async fn test_cache_hit() {
        let generator = TransitionGenerator::new(TransitionConfig::default());
        generator.generate("get_weather", &ToolArgs::new()).await;
        let (_, source) = generator.generate_with_source("get_weather", &ToolArgs::new()).await;
        assert_eq!(source, TransitionSource::Cache);
        assert_eq!(generator.stats().cache_hits, 1);
        assert_eq!(generator.stats().rule_hits, 1);
    }

    struct OneLiner;

    #[async_trait]
    impl LanguageModel for OneLiner {
        async fn chat(&self, _: Vec<DialogueTurn>, _: Vec<FunctionSpec>) -> LlmResult<LlmStream> {
            Ok(futures::stream::iter(vec![Ok(LlmChunk::Text("马上就好\n多余的行".into()))]).boxed())
        }

        fn name(&self) -> &'static str {
            "one-liner"
        }
    }

    #[tokio::test]
    async fn test_llm_tier_when_enabled() {
        let generator = TransitionGenerator::new(TransitionConfig {
            llm_fallback: true,
            ..Default::default()
        })
        .with_llm(Arc::new(OneLiner));
        let (text, source) = generator.generate_with_source("xyzzy", &ToolArgs::new()).await;
        assert_eq!(text, "马上就好");
        assert_eq!(source, TransitionSource::Llm);
    }

    #[test]
    fn test_categorize() {
        assert_eq!(categorize("order_cancel"), "order");
        assert_eq!(categorize("play_music"), "media");
        assert_eq!(categorize("get_weather"), "query");
        assert_eq!(categorize("xyzzy"), "other");
    }
}
