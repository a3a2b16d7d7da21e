//! Operator acknowledgment gate.
//!
//! Before the detectors are moved the operator must confirm a safety
//! precondition (by default: the EDX detector is retracted). The procedure
//! asks through [`OperatorGate`] and will not continue without a confirmation.

use async_trait::async_trait;
use std::io::BufRead;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Operator's answer at the safety gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The precondition holds; preparation continues.
    Confirmed,
    /// The run is abandoned and applied steps are rolled back.
    Declined,
}

/// Asks the operator to confirm a safety precondition.
#[async_trait]
pub trait OperatorGate: Send + Sync {
    /// Shows `prompt` and waits for the operator's answer.
    async fn acknowledge(&self, prompt: &str) -> Acknowledgement;
}

/// Confirms every prompt. For unattended runs and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoAcknowledge;

#[async_trait]
impl OperatorGate for AutoAcknowledge {
    async fn acknowledge(&self, prompt: &str) -> Acknowledgement {
        info!("Auto-acknowledged: {}", prompt);
        Acknowledgement::Confirmed
    }
}

/// Prompts on the terminal and reads the answer from stdin.
///
/// An empty line, `y` or `yes` confirms; anything else declines. The line
/// is read on a detached thread so a prompt abandoned by a stop does not keep
/// the runtime from shutting down.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleGate;

#[async_trait]
impl OperatorGate for ConsoleGate {
    async fn acknowledge(&self, prompt: &str) -> Acknowledgement {
        let mut stdout = tokio::io::stdout();
        let question = format!("\n{prompt} Continue? [Y/n] ");
        if let Err(err) = stdout.write_all(question.as_bytes()).await {
            warn!("Could not show prompt: {}", err);
            return Acknowledgement::Declined;
        }
        let _ = stdout.flush().await;

        let (tx, rx) = oneshot::channel();
        let reader = std::thread::Builder::new()
            .name("operator-prompt".into())
            .spawn(move || {
                let mut line = String::new();
                let result = std::io::stdin().lock().read_line(&mut line).map(|_| line);
                let _ = tx.send(result);
            });
        if let Err(err) = reader {
            warn!("Could not start prompt reader: {}", err);
            return Acknowledgement::Declined;
        }

        match rx.await {
            Ok(Ok(line)) => parse_answer(&line),
            Ok(Err(err)) => {
                warn!("Could not read operator answer: {}", err);
                Acknowledgement::Declined
            }
            Err(_) => Acknowledgement::Declined,
        }
    }
}

fn parse_answer(line: &str) -> Acknowledgement {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => Acknowledgement::Confirmed,
        _ => Acknowledgement::Declined,
    }
}
