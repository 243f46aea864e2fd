//! Provider registry.
//!
//! Backends for VAD, ASR, LLM, TTS and memory are registered by name at
//! startup and looked up when a session is created. A provider registered as
//! shareable is built once and handed to every session; otherwise each
//! session gets its own instance. VAD detectors hold per-stream state and are
//! always built per session.
//!
//! The binary registers the development set from [`dev`]:
//!
//! | kind   | name     |
//! |--------|----------|
//! | vad    | `energy` |
//! | asr    | `null`   |
//! | llm    | `echo`   |
//! | tts    | `tone`   |
//! | memory | `noop`   |

mod dev;

pub use dev::{EchoModel, NullRecognizer, ToneSynthesizer};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::asr::SpeechRecognizer;
use crate::core::ingress::{EnergyVoiceDetector, VoiceDetector};
use crate::core::llm::LanguageModel;
use crate::core::memory::{Memory, NoopMemory};
use crate::core::tts::TextToSpeech;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Vad,
    Asr,
    Llm,
    Tts,
    Memory,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [Self::Vad, Self::Asr, Self::Llm, Self::Tts, Self::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vad => "vad",
            Self::Asr => "asr",
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Unknown {kind} provider: {name}")]
    Unknown { kind: ProviderKind, name: String },
    #[error("Failed to create {kind} provider {name}: {reason}")]
    Creation {
        kind: ProviderKind,
        name: String,
        reason: String,
    },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

type Factory<T> = Arc<dyn Fn() -> Result<T, String> + Send + Sync>;

struct Entry<T> {
    factory: Factory<T>,
    shareable: bool,
    shared: OnceCell<T>,
}

impl<T: Clone> Entry<T> {
    fn instance(&self, kind: ProviderKind, name: &str) -> ProviderResult<T> {
        let build = || {
            (self.factory)().map_err(|reason| ProviderError::Creation {
                kind,
                name: name.to_string(),
                reason,
            })
        };
        if self.shareable {
            self.shared.get_or_try_init(build).cloned()
        } else {
            build()
        }
    }
}

/// Which provider to use for each stage, by registered name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectedModules {
    pub vad: String,
    pub asr: String,
    pub llm: String,
    pub tts: String,
    pub memory: String,
}

impl Default for SelectedModules {
    fn default() -> Self {
        Self {
            vad: "energy".to_string(),
            asr: "null".to_string(),
            llm: "echo".to_string(),
            tts: "tone".to_string(),
            memory: "noop".to_string(),
        }
    }
}

impl SelectedModules {
    pub fn name(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::Vad => &self.vad,
            ProviderKind::Asr => &self.asr,
            ProviderKind::Llm => &self.llm,
            ProviderKind::Tts => &self.tts,
            ProviderKind::Memory => &self.memory,
        }
    }
}

/// Everything one session needs from the backends.
pub struct SessionProviders {
    pub vad: Box<dyn VoiceDetector>,
    pub asr: Arc<dyn SpeechRecognizer>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub memory: Arc<dyn Memory>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    vad: RwLock<HashMap<String, Factory<Box<dyn VoiceDetector>>>>,
    asr: RwLock<HashMap<String, Arc<Entry<Arc<dyn SpeechRecognizer>>>>>,
    llm: RwLock<HashMap<String, Arc<Entry<Arc<dyn LanguageModel>>>>>,
    tts: RwLock<HashMap<String, Arc<Entry<Arc<dyn TextToSpeech>>>>>,
    memory: RwLock<HashMap<String, Arc<Entry<Arc<dyn Memory>>>>>,
}

fn entry<T>(shareable: bool, factory: Factory<T>) -> Arc<Entry<T>> {
    Arc::new(Entry {
        factory,
        shareable,
        shared: OnceCell::new(),
    })
}

fn lookup<T: Clone>(
    map: &RwLock<HashMap<String, Arc<Entry<T>>>>,
    kind: ProviderKind,
    name: &str,
) -> ProviderResult<T> {
    // the entry is cloned out so a slow factory never holds the map lock
    let found = map.read().get(name).cloned();
    match found {
        Some(entry) => entry.instance(kind, name),
        None => Err(ProviderError::Unknown {
            kind,
            name: name.to_string(),
        }),
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the development providers listed in the module docs.
    pub fn with_dev_providers() -> Self {
        let registry = Self::new();
        registry.register_vad("energy", || Ok(Box::new(EnergyVoiceDetector::default())));
        registry.register_asr("null", true, || Ok(Arc::new(NullRecognizer)));
        registry.register_llm("echo", true, || Ok(Arc::new(EchoModel::default())));
        registry.register_tts("tone", true, || Ok(Arc::new(ToneSynthesizer::default())));
        registry.register_memory("noop", true, || Ok(Arc::new(NoopMemory)));
        registry
    }

    pub fn register_vad<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn VoiceDetector>, String> + Send + Sync + 'static,
    {
        debug!("Registering vad provider {}", name);
        self.vad.write().insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_asr<F>(&self, name: &str, shareable: bool, factory: F)
    where
        F: Fn() -> Result<Arc<dyn SpeechRecognizer>, String> + Send + Sync + 'static,
    {
        debug!("Registering asr provider {} (shareable: {})", name, shareable);
        self.asr.write().insert(name.to_string(), entry(shareable, Arc::new(factory)));
    }

    pub fn register_llm<F>(&self, name: &str, shareable: bool, factory: F)
    where
        F: Fn() -> Result<Arc<dyn LanguageModel>, String> + Send + Sync + 'static,
    {
        debug!("Registering llm provider {} (shareable: {})", name, shareable);
        self.llm.write().insert(name.to_string(), entry(shareable, Arc::new(factory)));
    }

    pub fn register_tts<F>(&self, name: &str, shareable: bool, factory: F)
    where
        F: Fn() -> Result<Arc<dyn TextToSpeech>, String> + Send + Sync + 'static,
    {
        debug!("Registering tts provider {} (shareable: {})", name, shareable);
        self.tts.write().insert(name.to_string(), entry(shareable, Arc::new(factory)));
    }

    pub fn register_memory<F>(&self, name: &str, shareable: bool, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Memory>, String> + Send + Sync + 'static,
    {
        debug!("Registering memory provider {} (shareable: {})", name, shareable);
        self.memory.write().insert(name.to_string(), entry(shareable, Arc::new(factory)));
    }

    pub fn contains(&self, kind: ProviderKind, name: &str) -> bool {
        match kind {
            ProviderKind::Vad => self.vad.read().contains_key(name),
            ProviderKind::Asr => self.asr.read().contains_key(name),
            ProviderKind::Llm => self.llm.read().contains_key(name),
            ProviderKind::Tts => self.tts.read().contains_key(name),
            ProviderKind::Memory => self.memory.read().contains_key(name),
        }
    }

    /// Registered names of one kind, sorted.
    pub fn names(&self, kind: ProviderKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            ProviderKind::Vad => self.vad.read().keys().cloned().collect(),
            ProviderKind::Asr => self.asr.read().keys().cloned().collect(),
            ProviderKind::Llm => self.llm.read().keys().cloned().collect(),
            ProviderKind::Tts => self.tts.read().keys().cloned().collect(),
            ProviderKind::Memory => self.memory.read().keys().cloned().collect(),
        };
        names.sort();
        names
    }

    pub fn vad(&self, name: &str) -> ProviderResult<Box<dyn VoiceDetector>> {
        let factory = self.vad.read().get(name).cloned();
        let factory = factory.ok_or_else(|| ProviderError::Unknown {
            kind: ProviderKind::Vad,
            name: name.to_string(),
        })?;
        factory().map_err(|reason| ProviderError::Creation {
            kind: ProviderKind::Vad,
            name: name.to_string(),
            reason,
        })
    }

    pub fn asr(&self, name: &str) -> ProviderResult<Arc<dyn SpeechRecognizer>> {
        lookup(&self.asr, ProviderKind::Asr, name)
    }

    pub fn llm(&self, name: &str) -> ProviderResult<Arc<dyn LanguageModel>> {
        lookup(&self.llm, ProviderKind::Llm, name)
    }

    pub fn tts(&self, name: &str) -> ProviderResult<Arc<dyn TextToSpeech>> {
        lookup(&self.tts, ProviderKind::Tts, name)
    }

    pub fn memory(&self, name: &str) -> ProviderResult<Arc<dyn Memory>> {
        lookup(&self.memory, ProviderKind::Memory, name)
    }

    /// Names in `selected` that are not registered.
    pub fn missing(&self, selected: &SelectedModules) -> Vec<(ProviderKind, String)> {
        ProviderKind::ALL
            .iter()
            .filter(|kind| !self.contains(**kind, selected.name(**kind)))
            .map(|kind| (*kind, selected.name(*kind).to_string()))
            .collect()
    }

    /// Resolve the selected providers for a new session.
    pub fn build_session_set(&self, selected: &SelectedModules) -> ProviderResult<SessionProviders> {
        let providers = SessionProviders {
            vad: self.vad(&selected.vad)?,
            asr: self.asr(&selected.asr)?,
            llm: self.llm(&selected.llm)?,
            tts: self.tts(&selected.tts)?,
            memory: self.memory(&selected.memory)?,
        };
        info!(
            "Session providers: vad={} asr={} llm={} tts={} memory={}",
            providers.vad.name(),
            providers.asr.name(),
            providers.llm.name(),
            providers.tts.name(),
            providers.memory.name()
        );
        Ok(providers)
    }
}
