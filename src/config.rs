//! Configuração do gateway carregada a partir de `iconforge.toml`.
//!
//! A struct [`GatewayConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::provider::{ApiKey, RemotePollSettings, RemoteSyncSettings};
use crate::quota::{BypassPolicy, PlanLimits};
use crate::retry::RetryPolicy;
use crate::scheduler::{ProgressSimulation, SchedulerConfig};

/// Nome do arquivo procurado no diretório atual quando `--config` não é dado.
pub const DEFAULT_CONFIG_FILE: &str = "iconforge.toml";

/// Configuração de nível superior carregada de `iconforge.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Endereço de escuta do servidor HTTP.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// URL pública usada nos links de artefatos. Derivada de host/porta se ausente.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Diretório onde as imagens geradas são gravadas.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Limite diário do plano free.
    #[serde(default = "default_free_daily_limit")]
    pub free_daily_limit: Option<u32>,

    /// Limite diário do plano pro. Ausente significa ilimitado.
    #[serde(default)]
    pub pro_daily_limit: Option<u32>,

    /// Desliga a verificação de cota para todos os chamadores.
    #[serde(default)]
    pub bypass_quota: bool,

    /// Prefixo de ID que identifica desenvolvedores confiáveis.
    #[serde(default = "default_developer_prefix")]
    pub developer_prefix: String,

    /// Requisições de geração por origem a cada 60 segundos.
    #[serde(default = "default_ip_rpm_limit")]
    pub ip_rpm_limit: usize,

    #[serde(default = "default_concurrency")]
    pub global_concurrency: usize,

    #[serde(default = "default_concurrency")]
    pub per_caller_concurrency: usize,

    /// Pausa entre os estágios simulados de progresso, em milissegundos.
    #[serde(default = "default_progress_pause_ms")]
    pub progress_pause_ms: u64,

    /// Tentativas por chamada remota, incluindo a primeira.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Tempo de retenção de jobs terminados. Ausente mantém tudo em memória.
    #[serde(default)]
    pub job_ttl_secs: Option<u64>,

    /// Semente do renderizador local.
    #[serde(default = "default_local_seed")]
    pub local_seed: u64,

    /// Emite logs em JSON.
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub dashscope: DashScopeConfig,

    #[serde(default)]
    pub modelscope: ModelScopeConfig,
}

/// Backend premium (DashScope, chamada síncrona).
#[derive(Debug, Clone, Deserialize)]
pub struct DashScopeConfig {
    #[serde(default = "default_dashscope_base_url")]
    pub base_url: String,
    #[serde(default = "default_dashscope_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: ApiKey,
}

/// Backend padrão (ModelScope, envio e polling).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelScopeConfig {
    #[serde(default = "default_modelscope_base_url")]
    pub base_url: String,
    #[serde(default = "default_modelscope_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: ApiKey,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_free_daily_limit() -> Option<u32> {
    Some(2)
}

fn default_developer_prefix() -> String {
    "dev-".to_string()
}

fn default_ip_rpm_limit() -> usize {
    30
}

fn default_concurrency() -> usize {
    3
}

fn default_progress_pause_ms() -> u64 {
    400
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    800
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_local_seed() -> u64 {
    crate::provider::local::DEFAULT_SEED
}

fn default_dashscope_base_url() -> String {
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/multimodal-generation".to_string()
}

fn default_dashscope_model() -> String {
    "qwen-image".to_string()
}

fn default_modelscope_base_url() -> String {
    "https://api-inference.modelscope.cn/v1".to_string()
}

fn default_modelscope_model() -> String {
    "Qwen/Qwen-Image".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_polls() -> u32 {
    30
}

impl Default for DashScopeConfig {
    fn default() -> Self {
        Self {
            base_url: default_dashscope_base_url(),
            model: default_dashscope_model(),
            api_key: ApiKey::default(),
        }
    }
}

impl Default for ModelScopeConfig {
    fn default() -> Self {
        Self {
            base_url: default_modelscope_base_url(),
            model: default_modelscope_model(),
            api_key: ApiKey::default(),
            poll_interval_secs: default_poll_interval_secs(),
            max_polls: default_max_polls(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            artifact_dir: default_artifact_dir(),
            free_daily_limit: default_free_daily_limit(),
            pro_daily_limit: None,
            bypass_quota: false,
            developer_prefix: default_developer_prefix(),
            ip_rpm_limit: default_ip_rpm_limit(),
            global_concurrency: default_concurrency(),
            per_caller_concurrency: default_concurrency(),
            progress_pause_ms: default_progress_pause_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            http_timeout_secs: default_http_timeout_secs(),
            job_ttl_secs: None,
            local_seed: default_local_seed(),
            log_json: false,
            dashscope: DashScopeConfig::default(),
            modelscope: ModelScopeConfig::default(),
        }
    }
}

// Interpreta uma flag booleana no estilo "1/true/yes/y/on".
fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid value for {name}"))
}

impl GatewayConfig {
    /// Carrega a configuração do arquivo indicado, ou de `iconforge.toml`
    /// no diretório atual. Usa valores padrão se o arquivo padrão não existir.
    /// Depois aplica as variáveis de ambiente do processo.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str::<GatewayConfig>(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Sobrescreve campos a partir de variáveis de ambiente.
    ///
    /// `lookup` abstrai `std::env::var` para que os testes não dependam do
    /// ambiente do processo. Valores vazios são ignorados.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ICONFORGE_HOST") {
            self.host = v.trim().to_string();
        }
        if let Some(v) = get("ICONFORGE_PORT") {
            self.port = parse_number("ICONFORGE_PORT", &v)?;
        }
        if let Some(v) = get("ICONFORGE_PUBLIC_URL") {
            self.public_url = Some(v.trim().to_string());
        }
        if let Some(v) = get("ICONFORGE_ARTIFACT_DIR") {
            self.artifact_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = get("ICONFORGE_FREE_DAILY_LIMIT") {
            self.free_daily_limit = Some(parse_number("ICONFORGE_FREE_DAILY_LIMIT", &v)?);
        }
        // Valor presente mas inválido deixa o plano pro sem limite.
        if let Some(v) = lookup("ICONFORGE_PRO_DAILY_LIMIT") {
            self.pro_daily_limit = v.trim().parse().ok();
        }
        if let Some(v) = get("ICONFORGE_BYPASS_QUOTA") {
            self.bypass_quota = parse_flag(&v);
        }
        if let Some(v) = get("ICONFORGE_IP_RPM_LIMIT") {
            self.ip_rpm_limit = parse_number("ICONFORGE_IP_RPM_LIMIT", &v)?;
        }
        if let Some(v) = get("ICONFORGE_JOB_TTL_SECS") {
            self.job_ttl_secs = Some(parse_number("ICONFORGE_JOB_TTL_SECS", &v)?);
        }

        if let Some(v) = get("DASHSCOPE_BASE_URL") {
            self.dashscope.base_url = v.trim().trim_end_matches('/').to_string();
        }
        if let Some(v) = get("DASHSCOPE_T2I_MODEL") {
            self.dashscope.model = v.trim().to_string();
        }
        if let Some(v) = get("DASHSCOPE_API_KEY") {
            self.dashscope.api_key = ApiKey::new(v);
        }
        if let Some(v) = get("MODELSCOPE_API_BASE") {
            self.modelscope.base_url = v.trim().trim_end_matches('/').to_string();
        }
        if let Some(v) = get("MODELSCOPE_T2I_MODEL") {
            self.modelscope.model = v.trim().to_string();
        }
        if let Some(v) = get("MODELSCOPE_API_KEY") {
            self.modelscope.api_key = ApiKey::new(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ip_rpm_limit == 0 {
            bail!("ip_rpm_limit must be at least 1");
        }
        if self.global_concurrency == 0 || self.per_caller_concurrency == 0 {
            bail!("concurrency limits must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.modelscope.max_polls == 0 {
            bail!("modelscope.max_polls must be at least 1");
        }
        Ok(())
    }

    /// Base pública dos links de artefatos, sem barra final.
    pub fn public_base(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn plan_limits(&self) -> PlanLimits {
        PlanLimits {
            free: self.free_daily_limit,
            pro: self.pro_daily_limit,
        }
    }

    pub fn bypass_policy(&self) -> BypassPolicy {
        BypassPolicy {
            global: self.bypass_quota,
            developer_prefix: self.developer_prefix.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            global_limit: self.global_concurrency,
            per_caller_limit: self.per_caller_concurrency,
            progress: ProgressSimulation {
                pause: Duration::from_millis(self.progress_pause_ms),
                ..ProgressSimulation::default()
            },
        }
    }

    pub fn job_ttl(&self) -> Option<Duration> {
        self.job_ttl_secs.map(Duration::from_secs)
    }

    pub fn remote_sync_settings(&self) -> RemoteSyncSettings {
        RemoteSyncSettings {
            base_url: self.dashscope.base_url.clone(),
            model: self.dashscope.model.clone(),
            api_key: self.dashscope.api_key.clone(),
        }
    }

    pub fn remote_poll_settings(&self) -> RemotePollSettings {
        RemotePollSettings {
            base_url: self.modelscope.base_url.clone(),
            model: self.modelscope.model.clone(),
            api_key: self.modelscope.api_key.clone(),
            poll_interval: Duration::from_secs(self.modelscope.poll_interval_secs),
            max_polls: self.modelscope.max_polls,
        }
    }
}
