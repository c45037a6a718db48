//! Line-based variable confirmation

use async_trait::async_trait;
use conduit_foundation::Result;
use conduit_task::InputSource;
use conduit_workflow::{Variable, VariablePrompter};
use std::io::Write;

/// Asks for each variable on the terminal before an agent starts.
/// An empty answer keeps the current value.
pub struct LinePrompter {
    input: InputSource,
}

impl LinePrompter {
    pub fn new(input: InputSource) -> Self {
        Self { input }
    }
}

fn question(variable: &Variable, current: Option<&str>) -> String {
    let mut text = variable.name.clone();
    if !variable.description.is_empty() {
        text.push_str(&format!(" ({})", variable.description));
    }
    if let Some(current) = current {
        text.push_str(&format!(" [{}]", current));
    }
    text.push_str(": ");
    text
}

#[async_trait]
impl VariablePrompter for LinePrompter {
    async fn prompt(&self, variable: &Variable, current: Option<&str>) -> Result<Option<String>> {
        {
            let mut stdout = std::io::stdout();
            write!(stdout, "{}", question(variable, current))?;
            stdout.flush()?;
        }

        Ok(self
            .input
            .read_line()
            .await
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_format() {
        let mut var = Variable::new("topic");
        assert_eq!(question(&var, None), "topic: ");

        var.description = "what to write about".to_string();
        assert_eq!(
            question(&var, Some("rust")),
            "topic (what to write about) [rust]: "
        );
    }

    #[tokio::test]
    async fn test_empty_answer_keeps_current() {
        let (tx, input) = InputSource::channel(4);
        let prompter = LinePrompter::new(input);
        let var = Variable::new("topic");

        tx.send(b"\n".to_vec()).await.unwrap();
        assert_eq!(prompter.prompt(&var, Some("x")).await.unwrap(), None);

        tx.send(b"  go \n".to_vec()).await.unwrap();
        assert_eq!(
            prompter.prompt(&var, None).await.unwrap(),
            Some("go".to_string())
        );

        drop(tx);
        assert_eq!(prompter.prompt(&var, None).await.unwrap(), None);
    }
}
