//! Interface de linha de comando do multigen baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, extract, models)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::ProofreadMode;

/// multigen: gera um documento em vários alvos em paralelo, com revisão encadeada.
#[derive(Debug, Parser)]
#[command(name = "multigen", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração (padrão: ./multigen.toml, se existir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Modo de revisão aceito pela CLI, mapeado para [`ProofreadMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProofreadArg {
    /// Sem estágio de revisão.
    Off,
    /// Revisão livre do texto gerado.
    Rewrite,
    /// Revisão por regras, devolvendo achados estruturados.
    Rules,
}

impl From<ProofreadArg> for ProofreadMode {
    fn from(arg: ProofreadArg) -> Self {
        match arg {
            ProofreadArg::Off => ProofreadMode::Off,
            ProofreadArg::Rewrite => ProofreadMode::Rewrite,
            ProofreadArg::Rules => ProofreadMode::Rules,
        }
    }
}

/// Argumentos do subcomando `run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Documento de origem: texto, PDF ou imagem (png, jpeg, gif, webp).
    pub source: PathBuf,

    /// Alvos separados por vírgula (ex.: fr,de,pt-BR).
    #[arg(long, short, value_delimiter = ',', required = true)]
    pub targets: Vec<String>,

    /// Id lógico do modelo (padrão: `default_model` da configuração).
    #[arg(long)]
    pub model: Option<String>,

    /// Sobrescreve o modo de revisão da configuração.
    #[arg(long)]
    pub proofread: Option<ProofreadArg>,

    /// Id do documento pai (padrão: nome do arquivo de origem).
    #[arg(long)]
    pub parent: Option<String>,

    /// Quantas vezes retentar automaticamente um alvo falho ou travado.
    #[arg(long, default_value_t = 0)]
    pub retries: u32,

    /// Diretório onde gravar o resultado de cada alvo.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Imprime o relatório completo em JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Gera o documento para cada alvo e encadeia a revisão.
    Run(RunArgs),

    /// Extrai registros JSON de uma resposta de modelo (arquivo ou stdin).
    Extract {
        /// Arquivo com a resposta bruta; lê do stdin se omitido.
        file: Option<PathBuf>,

        /// Aceita apenas registros com os campos de um achado de revisão.
        #[arg(long, default_value_t = false)]
        findings: bool,
    },

    /// Lista os modelos configurados.
    Models,
}
