use anyhow::{bail, Result};
use resilience_engine::diagnostics::ContentExpectation;
use resilience_engine::{Classifier, ConsoleLevel, DiagnosticResult, ErrorCategory};

pub struct ClassifyCommand {
    pub text: Option<String>,
    pub level: ConsoleLevel,
    pub status: Option<u16>,
    pub url: String,
    pub content_type: Option<String>,
    pub json: bool,
}

impl ClassifyCommand {
    pub fn execute(&self) -> Result<()> {
        let classifier = Classifier::new();
        let diagnostic = match (self.status, &self.text) {
            (Some(status), _) => {
                let expectation = ContentExpectation::for_url(&self.url);
                match classifier.classify_http(&self.url, status, self.content_type.as_deref(), expectation) {
                    Some(diagnostic) => diagnostic,
                    None => {
                        println!("✅ HTTP {status} from {} is healthy", self.url);
                        return Ok(());
                    }
                }
            }
            (None, Some(text)) => classifier.classify_text(text, self.level, ErrorCategory::Script),
            (None, None) => bail!("Provide error text or --status to classify"),
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&diagnostic)?);
        } else {
            print_diagnostic(&diagnostic);
        }
        Ok(())
    }
}

fn print_diagnostic(diagnostic: &DiagnosticResult) {
    println!("🔎 {}", diagnostic.message);
    println!("   🏷️  Category: {}/{}", diagnostic.category, diagnostic.kind);
    println!("   🚨 Severity: {}", diagnostic.severity);
    if !diagnostic.suggested_remedy.is_empty() {
        println!("   💡 {}", diagnostic.suggested_remedy);
    }
}
