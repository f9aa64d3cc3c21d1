//! Configuração do multigen carregada a partir de `multigen.toml`.
//!
//! A struct [`MultigenConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::PipelineError;

/// Modo do estágio derivado (revisão) encadeado após cada tradução.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofreadMode {
    /// Nenhum estágio derivado.
    Off,
    /// Revisão livre: o modelo devolve o texto corrigido.
    Rewrite,
    /// Revisão por regras: o modelo devolve achados em JSON.
    Rules,
}

/// O que fazer quando a revisão por regras devolve uma lista vazia bem formada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyFindings {
    /// Concluir com zero achados ("nada a corrigir").
    Complete,
    /// Marcar a unidade como falha.
    Fail,
}

/// Um modelo configurado, identificado por um id lógico.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Id lógico usado nas submissões (ex.: "sonnet").
    pub id: String,
    /// Nome do modelo no provedor (ex.: "claude-sonnet-4-5-20250929").
    pub provider_model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

/// Configuração de nível superior carregada de `multigen.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct MultigenConfig {
    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    /// Id do modelo padrão quando não especificado via CLI.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Modelos disponíveis para submissão.
    #[serde(default = "default_models")]
    pub models: Vec<ModelEntry>,

    /// Intervalo de polling do status, em milissegundos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tempo sem progresso até uma unidade ser considerada travada.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Máximo de alvos por execução.
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,

    #[serde(default = "default_proofread")]
    pub proofread: ProofreadMode,

    /// Modelo do estágio de revisão; usa o modelo da execução se ausente.
    #[serde(default)]
    pub proofread_model: Option<String>,

    /// Regras de estilo para a revisão por regras.
    #[serde(default)]
    pub proofread_rules: Vec<String>,

    #[serde(default = "default_empty_findings")]
    pub empty_findings: EmptyFindings,

    /// Capacidade do canal de eventos de cada execução.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    8192
}

// Valor padrão para o modelo: "sonnet".
fn default_model() -> String {
    "sonnet".to_string()
}

fn default_models() -> Vec<ModelEntry> {
    [
        ("haiku", "claude-haiku-4-5-20251001"),
        ("sonnet", "claude-sonnet-4-5-20250929"),
        ("opus", "claude-opus-4-6"),
    ]
    .into_iter()
    .map(|(id, provider_model)| ModelEntry {
        id: id.to_string(),
        provider_model: provider_model.to_string(),
        enabled: true,
        max_tokens: default_max_tokens(),
    })
    .collect()
}

// Valor padrão do polling: 2000ms.
fn default_poll_interval_ms() -> u64 {
    2000
}

// Valor padrão para travamento: 2 minutos.
fn default_stall_timeout_ms() -> u64 {
    120_000
}

fn default_max_targets() -> usize {
    32
}

fn default_proofread() -> ProofreadMode {
    ProofreadMode::Rewrite
}

fn default_empty_findings() -> EmptyFindings {
    EmptyFindings::Complete
}

fn default_event_buffer() -> usize {
    256
}

impl Default for MultigenConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            default_model: default_model(),
            models: default_models(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            max_targets: default_max_targets(),
            proofread: default_proofread(),
            proofread_model: None,
            proofread_rules: Vec::new(),
            empty_findings: default_empty_findings(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl MultigenConfig {
    /// Carrega a configuração de `multigen.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        let path = Path::new("multigen.toml");
        let config = if path.exists() {
            Self::read(path)?
        } else {
            Self::default()
        };
        Ok(config.with_env())
    }

    /// Carrega a configuração de um caminho explícito; o arquivo deve existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        Ok(Self::read(path)?.with_env())
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str::<MultigenConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
    fn with_env(mut self) -> Self {
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            self.api_key = key;
        }
        self
    }

    /// Rejeita valores que tornariam o polling ou o fan-out inviáveis.
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.stall_timeout_ms < self.poll_interval_ms {
            return Err(PipelineError::Config(
                "stall_timeout_ms must not be shorter than poll_interval_ms".into(),
            ));
        }
        if self.max_targets == 0 {
            return Err(PipelineError::Config("max_targets must be > 0".into()));
        }
        if self.event_buffer == 0 {
            return Err(PipelineError::Config("event_buffer must be > 0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::new(self.models.clone())
    }
}

/// Resolve ids lógicos de modelo para entradas configuradas.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        Self { entries }
    }

    /// Devolve o modelo habilitado com o id dado.
    pub fn resolve(&self, model_id: &str) -> std::result::Result<&ModelEntry, PipelineError> {
        let entry = self
            .entries
            .iter()
            .find(|m| m.id == model_id)
            .ok_or_else(|| PipelineError::ModelUnavailable(format!("unknown model `{model_id}`")))?;
        if !entry.enabled {
            return Err(PipelineError::ModelUnavailable(format!(
                "model `{model_id}` is disabled"
            )));
        }
        Ok(entry)
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = MultigenConfig::default();
        assert_eq!(config.default_model, "sonnet");
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.stall_timeout_ms, 120_000);
        assert_eq!(config.proofread, ProofreadMode::Rewrite);
        assert_eq!(config.empty_findings, EmptyFindings::Complete);
        assert_eq!(config.models.len(), 3);
        assert!(config.api_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_key = "sk-test-123"
            stall_timeout_ms = 30000
            proofread = "rules"
            proofread_rules = ["Use the serial comma"]

            [[models]]
            id = "fast"
            provider_model = "claude-haiku-4-5-20251001"
            max_tokens = 1024
        "#;
        let config: MultigenConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_key, "sk-test-123");
        assert_eq!(config.stall_timeout_ms, 30_000);
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.proofread, ProofreadMode::Rules);
        assert_eq!(config.proofread_rules, vec!["Use the serial comma"]);
        assert_eq!(config.models.len(), 1);
        assert!(config.models[0].enabled);
        assert_eq!(config.models[0].max_tokens, 1024);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multigen.toml");
        std::fs::write(&path, "poll_interval_ms = 500\nempty_findings = \"fail\"\n").unwrap();

        let config = MultigenConfig::load_from(&path).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.empty_findings, EmptyFindings::Fail);
    }

    #[test]
    fn load_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multigen.toml");
        std::fs::write(&path, "poll_interval_ms = 5000\nstall_timeout_ms = 1000\n").unwrap();
        assert!(MultigenConfig::load_from(&path).is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        // No ambiente de teste, tipicamente não há multigen.toml no diretório de trabalho.
        let config = MultigenConfig::load().unwrap();
        assert_eq!(config.stall_timeout_ms, 120_000);
    }

    #[test]
    fn registry_resolves_enabled_models_only() {
        let registry = ModelRegistry::new(vec![
            ModelEntry {
                id: "fast".into(),
                provider_model: "claude-haiku-4-5-20251001".into(),
                enabled: true,
                max_tokens: 1024,
            },
            ModelEntry {
                id: "retired".into(),
                provider_model: "claude-2".into(),
                enabled: false,
                max_tokens: 1024,
            },
        ]);

        assert_eq!(
            registry.resolve("fast").unwrap().provider_model,
            "claude-haiku-4-5-20251001"
        );
        assert!(matches!(
            registry.resolve("retired"),
            Err(PipelineError::ModelUnavailable(msg)) if msg.contains("disabled")
        ));
        assert!(matches!(
            registry.resolve("missing"),
            Err(PipelineError::ModelUnavailable(_))
        ));
    }
}
