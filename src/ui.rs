//! Interface de terminal do iconforge: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job de geração no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::jobs::{JobStatus, JobView};
use crate::provider::Tier;

// Resolução da barra: progresso em [0, 1] vira 0..=100.
const BAR_LEN: u64 = 100;

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe uma barra durante o processamento e mensagens coloridas
/// para sucesso (verde) e falha (vermelho). Fallbacks aparecem em amarelo.
pub struct JobProgress {
    // Barra de progresso do indicatif.
    pb: ProgressBar,
    // Estilo verde para mensagens de sucesso.
    green: Style,
    // Estilo vermelho para mensagens de falha.
    red: Style,
    // Estilo amarelo para avisos de fallback.
    yellow: Style,
}

impl JobProgress {
    /// Inicia a barra com o ID do job e retorna a instância de progresso.
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new(BAR_LEN);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:32.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style.progress_chars("=> "));
        pb.set_message(job_id.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a barra a partir de um snapshot do job.
    pub fn update(&self, view: &JobView) {
        let progress = view.progress.unwrap_or(0.0).clamp(0.0, 1.0);
        self.pb.set_position((progress * BAR_LEN as f32).round() as u64);
        self.pb.set_message(format!("{} {}", view.job_id, view.status));
    }

    /// Finaliza a barra e exibe o resultado final do job.
    ///
    /// Sucesso é mostrado em verde com checkmark; falha em vermelho com X.
    /// Causas de tiers que falharam antes aparecem em amarelo.
    pub fn complete(&self, view: &JobView) {
        self.pb.finish_and_clear();
        match view.status {
            JobStatus::Completed => {
                println!(
                    "  {} Icon ready: {}",
                    self.green.apply_to("✓"),
                    view.result_ref.as_deref().unwrap_or("-")
                );
                if let Some(trail) = &view.error {
                    println!("  {} Fallbacks: {trail}", self.yellow.apply_to("↓"));
                }
            }
            _ => {
                println!(
                    "  {} Job failed: {}",
                    self.red.apply_to("✗"),
                    view.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    /// Imprime o job final formatado em JSON com estilo colorido.
    pub fn print_job(&self, view: &JobView) {
        let style = match view.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", style.apply_to("─── Job ───"));
        println!("{}", serde_json::to_string_pretty(view).unwrap_or_default());
    }
}

/// Linha de status de um provedor para o subcomando `status`.
pub fn print_provider(tier: Tier, configured: bool) {
    let (mark, label) = if configured {
        (Style::new().green().apply_to("●"), "configured")
    } else {
        (Style::new().dim().apply_to("○"), "not-configured")
    };
    let tier = tier.to_string();
    println!("  {mark} {tier:<9} {label}");
}
