use anyhow::{anyhow, Result};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use regex::Regex;
use scraper::Html;
use strsim::jaro_winkler;

use crate::models::Application;

const SIMILARITY_THRESHOLD: f64 = 0.92;

/// Turns a pasted email or a raw RFC 822 message into the plain text the
/// parser prompt expects. Raw messages keep their Subject/From/Date headers
/// on top of the body.
pub fn prepare_email_text(raw: &[u8]) -> Result<String> {
    if looks_like_rfc822(raw) {
        let parsed = parse_mail(raw)?;
        let mut text = String::new();
        for header in ["Subject", "From", "Date"] {
            if let Some(value) = parsed.headers.get_first_value(header) {
                text.push_str(&format!("{}: {}\n", header, value));
            }
        }
        text.push('\n');
        text.push_str(&get_email_body(&parsed)?);
        Ok(text.trim().to_string())
    } else {
        let text = String::from_utf8_lossy(raw);
        if text.contains("<html") || text.contains("<body") {
            Ok(html_to_text(&text))
        } else {
            Ok(text.trim().to_string())
        }
    }
}

fn looks_like_rfc822(raw: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&raw[..raw.len().min(2048)]);
    let mut saw_header = false;
    for line in head.lines() {
        if line.is_empty() {
            break;
        }
        let lower = line.to_lowercase();
        if lower.starts_with("from:")
            || lower.starts_with("subject:")
            || lower.starts_with("mime-version:")
            || lower.starts_with("received:")
        {
            saw_header = true;
        } else if !line.starts_with([' ', '\t']) && !line.contains(':') {
            return false;
        }
    }
    saw_header
}

fn get_email_body(parsed: &ParsedMail) -> Result<String> {
    if parsed.subparts.is_empty() {
        let body = parsed.get_body()?;
        if parsed.ctype.mimetype.contains("html") {
            return Ok(html_to_text(&body));
        }
        return Ok(body);
    }

    // Prefer plain text; the model does better without markup.
    if let Some(part) = find_part(parsed, "text/plain") {
        return Ok(part.get_body()?);
    }
    if let Some(part) = find_part(parsed, "text/html") {
        return Ok(html_to_text(&part.get_body()?));
    }

    if let Some(part) = parsed.subparts.first() {
        return Ok(part.get_body()?);
    }

    Err(anyhow!("No email body found"))
}

fn find_part<'a, 'b>(parsed: &'a ParsedMail<'b>, mimetype: &str) -> Option<&'a ParsedMail<'b>> {
    if parsed.ctype.mimetype == mimetype && parsed.subparts.is_empty() {
        return Some(parsed);
    }
    parsed.subparts.iter().find_map(|part| find_part(part, mimetype))
}

pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    match Regex::new(r"[ \t\u{a0}]+") {
        Ok(re) => {
            let spaced = re.replace_all(text, " ");
            spaced
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        }
        Err(_) => text.trim().to_string(),
    }
}

/// Existing application that looks like the same company and title.
pub fn find_similar<'a>(
    existing: &'a [Application],
    company: &str,
    title: &str,
) -> Option<&'a Application> {
    let company = company.trim().to_lowercase();
    let title = title.trim().to_lowercase();
    existing.iter().find(|app| {
        jaro_winkler(&app.company_name.to_lowercase(), &company) >= SIMILARITY_THRESHOLD
            && jaro_winkler(&app.title.to_lowercase(), &title) >= SIMILARITY_THRESHOLD
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApplicationStatus;
    use chrono::Utc;

    const MULTIPART: &str = "From: Acme Careers <jobs@acme.example>\r\n\
Subject: Thanks for applying to Acme\r\n\
Date: Mon, 6 May 2024 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>We received your application for <b>Staff Engineer</b>.</p></body></html>\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
We received your application for Staff Engineer.\r\n\
--XYZ--\r\n";

    fn app(company: &str, title: &str) -> Application {
        let now = Utc::now();
        Application {
            id: "id".to_string(),
            user_id: "alice".to_string(),
            company_name: company.to_string(),
            title: title.to_string(),
            source_name: "Email".to_string(),
            applied_at: now,
            status: ApplicationStatus::Applied,
            location: None,
            salary: None,
            url: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            notes: Vec::new(),
            events: Vec::new(),
        }
    }

    #[test]
    fn test_prepare_multipart_prefers_plain_text() {
        let text = prepare_email_text(MULTIPART.as_bytes()).unwrap();
        assert!(text.starts_with("Subject: Thanks for applying to Acme"));
        assert!(text.contains("From: Acme Careers <jobs@acme.example>"));
        assert!(text.contains("We received your application for Staff Engineer."));
        assert!(!text.contains("<b>"));
    }

    #[test]
    fn test_prepare_html_only_message() {
        let raw = "From: jobs@acme.example\r\n\
Subject: Application received\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><h1>Hi</h1><p>Your   application   for SRE</p></body></html>\r\n";
        let text = prepare_email_text(raw.as_bytes()).unwrap();
        assert!(text.contains("Your application for SRE"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn test_prepare_pasted_text_is_passed_through() {
        let pasted = "  Hi Alice,\nthanks for applying: we will be in touch.\n";
        let text = prepare_email_text(pasted.as_bytes()).unwrap();
        assert_eq!(text, "Hi Alice,\nthanks for applying: we will be in touch.");
    }

    #[test]
    fn test_looks_like_rfc822() {
        assert!(looks_like_rfc822(MULTIPART.as_bytes()));
        assert!(!looks_like_rfc822(b"Dear candidate,\nFrom: us"));
        assert!(!looks_like_rfc822(b""));
    }

    #[test]
    fn test_html_to_text() {
        let text = html_to_text("<html><body><div>Staff\u{a0}Engineer</div><div>Acme</div></body></html>");
        assert!(text.contains("Staff Engineer"));
        assert!(text.contains("Acme"));
    }

    #[test]
    fn test_find_similar() {
        let existing = vec![app("Acme Corp", "Staff Engineer"), app("Globex", "SRE")];
        assert!(find_similar(&existing, "acme corp", "Staff Engineer").is_some());
        assert!(find_similar(&existing, "Acme Corp.", "Staff  Engineer").is_some());
        assert!(find_similar(&existing, "Initech", "Staff Engineer").is_none());
        assert!(find_similar(&existing, "Acme Corp", "Product Manager").is_none());
    }
}
