use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, info};

// --- Provider trait ---

pub trait AIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
    ClaudeCode,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

// (aliases, provider, model id, short name)
const MODELS: &[(&[&str], ProviderKind, &str, &str)] = &[
    (&["claude-sonnet", "sonnet"], ProviderKind::ClaudeCode, "claude-sonnet-4-5-20250929", "claude-sonnet"),
    (&["claude-haiku", "haiku"], ProviderKind::ClaudeCode, "claude-haiku-4-5-20251001", "claude-haiku"),
    (&["api-sonnet"], ProviderKind::Anthropic, "claude-sonnet-4-5-20250929", "api-sonnet"),
    (&["api-haiku"], ProviderKind::Anthropic, "claude-haiku-4-5-20251001", "api-haiku"),
    (&["gpt-4o"], ProviderKind::OpenAI, "gpt-4o", "gpt-4o"),
    (&["gpt-4o-mini"], ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini"),
];

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    MODELS
        .iter()
        .find(|(aliases, ..)| aliases.iter().any(|alias| *alias == name))
        .map(|(_, provider, model_id, short_name)| ModelSpec {
            provider: *provider,
            model_id: model_id.to_string(),
            short_name: short_name.to_string(),
        })
        .ok_or_else(|| {
            anyhow!(
                "Unknown model '{}'. Available: claude-sonnet (default), claude-haiku, \
                 api-sonnet, api-haiku, gpt-4o, gpt-4o-mini",
                name
            )
        })
}

pub fn create_provider(spec: &ModelSpec) -> Result<Box<dyn AIProvider>> {
    info!(model = %spec.short_name, "using language model");
    match spec.provider {
        ProviderKind::ClaudeCode => Ok(Box::new(ClaudeCodeProvider::new(spec.model_id.clone())?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(spec.model_id.clone())?)),
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

fn send_json(request: reqwest::blocking::RequestBuilder, vendor: &str) -> Result<reqwest::blocking::Response> {
    let response = request
        .send()
        .with_context(|| format!("Failed to send request to {} API", vendor))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().unwrap_or_default();
        return Err(anyhow!(
            "{} API request failed with status {}: {}",
            vendor,
            status,
            error_text
        ));
    }
    Ok(response)
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = ChatRequest {
            model: &self.model_id,
            max_tokens,
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let response = send_json(
            self.client
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&request),
            "Anthropic",
        )?;

        let api_response: AnthropicResponse = response
            .json()
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| anyhow!("No content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = ChatRequest {
            model: &self.model_id,
            max_tokens,
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let response = send_json(
            self.client
                .post(OPENAI_API_URL)
                .bearer_auth(&self.api_key)
                .json(&request),
            "OpenAI",
        )?;

        let api_response: OpenAIResponse = response
            .json()
            .context("Failed to parse OpenAI API response")?;

        api_response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Claude Code provider (shells out to `claude` CLI) ---

#[derive(Debug)]
pub struct ClaudeCodeProvider {
    model_id: String,
}

impl ClaudeCodeProvider {
    pub fn new(model_id: String) -> Result<Self> {
        std::process::Command::new("claude")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .context("'claude' CLI not found. Install it or pick an api-* / gpt-* model instead.")?;
        Ok(Self { model_id })
    }
}

impl AIProvider for ClaudeCodeProvider {
    fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
        let output = std::process::Command::new("claude")
            .arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(&self.model_id)
            .output()
            .context("Failed to run 'claude' CLI")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("claude CLI failed: {}", stderr));
        }

        let response = String::from_utf8(output.stdout)
            .context("Invalid UTF-8 in claude CLI output")?;

        if response.trim().is_empty() {
            return Err(anyhow!("Empty response from claude CLI"));
        }

        Ok(response)
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Structured output ---

/// Strips ```json ... ``` or ``` ... ``` fences some models wrap around JSON.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest).trim_start();
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn complete_json<T: DeserializeOwned>(provider: &dyn AIProvider, prompt: &str) -> Result<T> {
    let response = provider.complete(prompt, 2048)?;
    debug!(model = provider.model_name(), bytes = response.len(), "model responded");
    let body = strip_json_fences(&response);
    serde_json::from_str(body).with_context(|| {
        format!(
            "Model response did not match the expected JSON shape: {}",
            textwrap::fill(body, 100)
        )
    })
}

// --- Email parsing ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEmail {
    pub company: String,
    pub title: String,
    /// ISO 8601 date as the model reported it; may be blank.
    pub applied_at: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub application_id: Option<String>,
}

pub fn parse_application_email(provider: &dyn AIProvider, raw_text: &str) -> Result<ParsedEmail> {
    if raw_text.trim().is_empty() {
        return Err(anyhow!("Email content cannot be empty."));
    }

    let prompt = format!(
        "You are an expert at extracting job application details from email text.\n\n\
        Your goal is to extract the company name, job title, application date, and application URL from the provided email text.\n\
        If a piece of information isn't found, leave it blank, do not guess.\n\n\
        Return ONLY a JSON object with the following keys:\n\
        - company (string): The name of the company.\n\
        - title (string): The job title.\n\
        - appliedAt (string): The date when the application was submitted (ISO format).\n\
        - url (string, optional): The URL of the job application, if available.\n\
        - applicationId (string, optional): The unique identifier of the application, if available.\n\n\
        Here is the email text:\n{}",
        raw_text
    );

    let mut parsed: ParsedEmail = complete_json(provider, &prompt)?;
    parsed.url = parsed.url.filter(|u| !u.trim().is_empty());
    parsed.application_id = parsed.application_id.filter(|id| !id.trim().is_empty());
    Ok(parsed)
}

// --- Analytics SQL ---

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSqlInput {
    pub table_name: String,
    pub user_id_field: String,
    pub source_name_field: String,
    pub status_field: String,
    pub applied_at_field: String,
    pub first_response_event_name: String,
    pub application_event_table: String,
    pub application_id_field: String,
    pub occurred_at_field: String,
    pub event_type_field: String,
}

impl Default for AnalyticsSqlInput {
    fn default() -> Self {
        Self {
            table_name: "Application".to_string(),
            user_id_field: "userId".to_string(),
            source_name_field: "sourceName".to_string(),
            status_field: "status".to_string(),
            applied_at_field: "appliedAt".to_string(),
            first_response_event_name: "first_response".to_string(),
            application_event_table: "ApplicationEvent".to_string(),
            application_id_field: "applicationId".to_string(),
            occurred_at_field: "occurredAt".to_string(),
            event_type_field: "type".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSql {
    pub applications_by_source: String,
    pub funnel_counts: String,
    pub avg_time_to_first_response: String,
    pub applications_per_week: String,
}

pub fn generate_analytics_sql(
    provider: &dyn AIProvider,
    input: &AnalyticsSqlInput,
) -> Result<AnalyticsSql> {
    let prompt = format!(
        "You are an expert SQL query generator specializing in creating analytics queries for a job application tracker.\n\n\
        Given the following table and field names, generate SQL queries for the following metrics:\n\n\
        Table Name: {}\n\
        User ID Field: {}\n\
        Source Name Field: {}\n\
        Status Field: {}\n\
        Applied At Field: {}\n\
        Application Event Table: {}\n\
        Application ID Field: {}\n\
        Occurred At Field: {}\n\
        Event Type Field: {}\n\
        First Response Event Name: {}\n\n\
        Queries:\n\
        1. Applications by source:\n\
        2. Funnel counts (applied, viewed, interview, offer):\n\
        3. Average time to first response:\n\
        4. Applications per week:\n\n\
        Return ONLY the SQL queries in a JSON format like this:\n\
        {{\n\
        \"applicationsBySource\": \"SQL QUERY\",\n\
        \"funnelCounts\": \"SQL QUERY\",\n\
        \"avgTimeToFirstResponse\": \"SQL QUERY\",\n\
        \"applicationsPerWeek\": \"SQL QUERY\"\n\
        }}",
        input.table_name,
        input.user_id_field,
        input.source_name_field,
        input.status_field,
        input.applied_at_field,
        input.application_event_table,
        input.application_id_field,
        input.occurred_at_field,
        input.event_type_field,
        input.first_response_event_name,
    );

    complete_json(provider, &prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct StubProvider {
        reply: String,
        prompts: RefCell<Vec<String>>,
    }

    impl StubProvider {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl AIProvider for StubProvider {
        fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
            self.prompts.borrow_mut().push(prompt.to_string());
            Ok(self.reply.clone())
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    #[test]
    fn test_resolve_model() {
        let spec = resolve_model("sonnet").unwrap();
        assert_eq!(spec.short_name, "claude-sonnet");
        assert_eq!(spec.provider, ProviderKind::ClaudeCode);

        let spec = resolve_model("api-haiku").unwrap();
        assert_eq!(spec.model_id, "claude-haiku-4-5-20251001");
        assert_eq!(spec.provider, ProviderKind::Anthropic);

        let spec = resolve_model("gpt-4o").unwrap();
        assert_eq!(spec.provider, ProviderKind::OpenAI);

        assert!(resolve_model("gpt-3").is_err());
    }

    #[test]
    fn test_strip_json_fences() {
        assert_eq!(strip_json_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_json_fences("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_json_fences("  {\"a\": 1}  "), "{\"a\": 1}");
        assert_eq!(strip_json_fences("```json\n{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_parse_email_reads_fenced_json() {
        let provider = StubProvider::new(
            "```json\n{\"company\": \"Acme\", \"title\": \"SRE\", \"appliedAt\": \"2024-05-01\", \
             \"url\": \"https://acme.example/jobs/1\", \"applicationId\": \"\"}\n```",
        );
        let parsed = parse_application_email(&provider, "Thanks for applying to Acme!").unwrap();
        assert_eq!(parsed.company, "Acme");
        assert_eq!(parsed.title, "SRE");
        assert_eq!(parsed.applied_at, "2024-05-01");
        assert_eq!(parsed.url.as_deref(), Some("https://acme.example/jobs/1"));
        assert_eq!(parsed.application_id, None);

        let prompts = provider.prompts.borrow();
        assert!(prompts[0].contains("Thanks for applying to Acme!"));
        assert!(prompts[0].contains("do not guess"));
    }

    #[test]
    fn test_parse_email_optional_fields_may_be_absent() {
        let provider = StubProvider::new(r#"{"company": "Acme", "title": "SRE", "appliedAt": ""}"#);
        let parsed = parse_application_email(&provider, "hello").unwrap();
        assert_eq!(parsed.url, None);
        assert_eq!(parsed.applied_at, "");
    }

    #[test]
    fn test_parse_email_rejects_missing_required_field() {
        let provider = StubProvider::new(r#"{"company": "Acme"}"#);
        assert!(parse_application_email(&provider, "hello").is_err());

        let provider = StubProvider::new("I could not find anything.");
        assert!(parse_application_email(&provider, "hello").is_err());
    }

    #[test]
    fn test_parse_email_rejects_empty_input_without_calling_model() {
        let provider = StubProvider::new("{}");
        let err = parse_application_email(&provider, "   \n").unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
        assert!(provider.prompts.borrow().is_empty());
    }

    #[test]
    fn test_generate_analytics_sql_templates_field_names() {
        let provider = StubProvider::new(
            r#"{"applicationsBySource": "SELECT 1", "funnelCounts": "SELECT 2",
                "avgTimeToFirstResponse": "SELECT 3", "applicationsPerWeek": "SELECT 4"}"#,
        );
        let input = AnalyticsSqlInput {
            table_name: "apps".to_string(),
            ..AnalyticsSqlInput::default()
        };
        let sql = generate_analytics_sql(&provider, &input).unwrap();
        assert_eq!(sql.applications_by_source, "SELECT 1");
        assert_eq!(sql.applications_per_week, "SELECT 4");

        let prompts = provider.prompts.borrow();
        assert!(prompts[0].contains("Table Name: apps"));
        assert!(prompts[0].contains("Application Event Table: ApplicationEvent"));
        assert!(prompts[0].contains("First Response Event Name: first_response"));
    }

    #[test]
    fn test_anthropic_provider_requires_api_key() {
        let original = env::var("ANTHROPIC_API_KEY").ok();
        unsafe { env::remove_var("ANTHROPIC_API_KEY"); }

        let result = AnthropicProvider::new("claude-sonnet-4-5-20250929".to_string());

        if let Some(val) = original {
            unsafe { env::set_var("ANTHROPIC_API_KEY", val); }
        }

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ANTHROPIC_API_KEY"));
    }
}
