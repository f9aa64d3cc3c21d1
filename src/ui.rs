//! Interface de terminal do multigen: um spinner por alvo e saída colorida.
//!
//! Usa `indicatif` para os spinners (um [`MultiProgress`] com uma linha por
//! alvo) e `console` para estilização. O [`RunProgress`] consome os
//! [`PipelineEvent`]s de uma execução e os reflete no terminal.

use std::collections::HashMap;
use std::time::Duration;

use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::extractor::Extraction;
use crate::orchestrator::PipelineEvent;
use crate::state_machine::{RunReport, StageAudit, StagePhase, TargetReport};

/// Progresso visual de uma execução com vários alvos.
pub struct RunProgress {
    // Container que desenha todos os spinners no stderr.
    multi: MultiProgress,
    // Um spinner por alvo, na ordem da submissão.
    bars: HashMap<String, ProgressBar>,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    /// Cria um spinner para cada alvo.
    pub fn start(targets: &[String]) -> Self {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {prefix:>12.bold} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let bars = targets
            .iter()
            .map(|target| {
                let pb = multi.add(ProgressBar::new_spinner());
                pb.set_style(style.clone());
                pb.set_prefix(target.clone());
                pb.set_message("QUEUED");
                pb.enable_steady_tick(Duration::from_millis(100));
                (target.clone(), pb)
            })
            .collect();

        Self {
            multi,
            bars,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Reflete um evento no spinner do alvo correspondente.
    pub fn handle(&self, event: &PipelineEvent) {
        if let PipelineEvent::Settled { report } = event {
            self.settle(report);
            return;
        }
        let Some(pb) = event.target().and_then(|t| self.bars.get(t)) else {
            return;
        };

        match event {
            PipelineEvent::Queued { stage, .. } => pb.set_message(format!("QUEUED {stage}")),
            PipelineEvent::Running { stage, .. } => pb.set_message(format!("RUNNING {stage}")),
            PipelineEvent::Completed {
                stage,
                duration_ms,
                findings,
                ..
            } => {
                let extra = findings
                    .map(|n| format!(", {n} findings"))
                    .unwrap_or_default();
                pb.set_message(format!(
                    "{} {stage} ({}{extra})",
                    self.green.apply_to("COMPLETED"),
                    format_ms(*duration_ms)
                ));
            }
            PipelineEvent::Failed {
                target,
                stage,
                error,
                ..
            } => {
                pb.set_message(format!("{} {stage}", self.red.apply_to("FAILED")));
                self.println(format!(
                    "  {} {target} {stage}: {error}",
                    self.red.apply_to("✗")
                ));
            }
            PipelineEvent::Stalled {
                target,
                stage,
                idle_ms,
                ..
            } => {
                pb.set_message(format!("{} {stage}", self.yellow.apply_to("STALLED")));
                self.println(format!(
                    "  {} {target} {stage}: no progress for {}",
                    self.yellow.apply_to("⚠"),
                    format_ms(*idle_ms)
                ));
            }
            PipelineEvent::Cancelled { stage, .. } => {
                pb.set_message(format!("{} {stage}", self.yellow.apply_to("CANCELLED")));
            }
            PipelineEvent::Retried { target, stage } => {
                pb.set_message(format!("RETRIED {stage}"));
                self.println(format!(
                    "  {} {target} {stage}: retrying",
                    self.yellow.apply_to("↻")
                ));
            }
            PipelineEvent::Settled { .. } => {}
        }
    }

    // Finaliza os spinners com o estado final de cada alvo.
    fn settle(&self, report: &RunReport) {
        for target in &report.targets {
            if let Some(pb) = self.bars.get(&target.target) {
                pb.finish_with_message(self.summary(target));
            }
        }
    }

    fn summary(&self, target: &TargetReport) -> String {
        let stage = target.current_stage();
        let Some(audit) = target.stage(stage) else {
            return String::new();
        };
        let label = self.phase_label(audit.phase);
        match audit.duration_ms {
            Some(ms) => format!("{label} {stage} ({})", format_ms(ms)),
            None => format!("{label} {stage}"),
        }
    }

    fn phase_label(&self, phase: StagePhase) -> String {
        let style = match phase {
            StagePhase::Completed => &self.green,
            StagePhase::Failed => &self.red,
            _ => &self.yellow,
        };
        style.apply_to(phase.to_string()).to_string()
    }

    fn println(&self, line: String) {
        if self.multi.println(&line).is_err() {
            eprintln!("{line}");
        }
    }

    /// Imprime o relatório final: uma linha por alvo e estágio, e o JSON completo se pedido.
    pub fn print_report(&self, report: &RunReport, json: bool) {
        println!();
        let header = if report.all_completed() {
            &self.green
        } else {
            &self.yellow
        };
        println!(
            "{}",
            header.apply_to(format!("─── Run {} ({}) ───", report.parent_id, report.model_id))
        );
        for target in &report.targets {
            self.print_stage(&target.target, &target.primary);
            if let Some(derived) = &target.derived {
                self.print_stage(&target.target, derived);
            }
        }

        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(report).unwrap_or_default()
            );
        }
    }

    fn print_stage(&self, target: &str, audit: &StageAudit) {
        let duration = audit.duration_ms.map(format_ms).unwrap_or_else(|| "-".into());
        let mut line = format!(
            "  {target:>12} {:<8} {:<20} {duration:>8}  attempts={}",
            audit.stage.to_string(),
            self.phase_label(audit.phase),
            audit.attempts
        );
        if let Some(findings) = audit.findings {
            line.push_str(&format!("  findings={findings}"));
        }
        if let Some(error) = &audit.error {
            line.push_str(&format!("  {}", self.red.apply_to(error)));
        }
        println!("{line}");
    }
}

/// Imprime o resultado do extrator: a forma reconhecida no stderr e os registros em JSON no stdout.
pub fn print_extraction(extraction: &Extraction) -> serde_json::Result<()> {
    let style = if extraction.is_recognized() {
        Style::new().green()
    } else {
        Style::new().red()
    };
    eprintln!(
        "{} {} record(s), shape {:?}",
        style.apply_to("●"),
        extraction.records.len(),
        extraction.shape
    );
    println!("{}", serde_json::to_string_pretty(&extraction.records)?);
    Ok(())
}

fn format_ms(ms: i64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
