//! Interface de linha de comando do iconforge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, generate, status)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::quota::Plan;

/// iconforge: gateway de geração de ícones com fallback entre provedores.
#[derive(Debug, Parser)]
#[command(name = "iconforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: ./iconforge.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Plano aceito pela CLI, mapeado para [`Plan`] internamente.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PlanArg {
    /// Plano gratuito com limite diário.
    Free,
    /// Plano pago, roteado primeiro para o provedor premium.
    Pro,
}

impl From<PlanArg> for Plan {
    fn from(arg: PlanArg) -> Self {
        match arg {
            PlanArg::Free => Plan::Free,
            PlanArg::Pro => Plan::Pro,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia o servidor HTTP.
    Serve,

    /// Gera um ícone no próprio processo e imprime o job final em JSON.
    Generate {
        /// Descrição do ícone.
        prompt: String,

        /// Tamanho do lado em pixels (limitado pelo plano).
        #[arg(long)]
        size: Option<u32>,

        #[arg(long, value_enum, default_value = "free")]
        plan: PlanArg,

        /// Estilo opcional anexado ao job.
        #[arg(long)]
        style: Option<String>,
    },

    /// Mostra quais provedores estão configurados e as cotas vigentes.
    Status,
}
