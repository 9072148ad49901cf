//! Small HTML builders for the email and draft digests. All text is escaped.

use std::borrow::Cow;

const TABLE_OPEN: &str =
    r#"<table border="1" cellpadding="6" cellspacing="0" style="border-collapse:collapse;">"#;
const WIDE_TABLE_OPEN: &str = r#"<table border="1" cellpadding="6" cellspacing="0" style="border-collapse:collapse;width:100%;">"#;

pub fn esc(text: &str) -> Cow<'_, str> {
    html_escape::encode_text(text)
}

fn attr(text: &str) -> Cow<'_, str> {
    html_escape::encode_double_quoted_attribute(text)
}

/// `<a href>` when there is a URL, plain escaped title otherwise.
pub fn link(url: &str, title: &str) -> String {
    if url.is_empty() {
        esc(title).into_owned()
    } else {
        format!(r#"<a href="{}">{}</a>"#, attr(url), esc(title))
    }
}

pub fn td(text: &str) -> String {
    format!("<td>{}</td>", esc(text))
}

pub fn td_html(html: &str) -> String {
    format!("<td>{}</td>", html)
}

pub fn td_em(text: &str) -> String {
    format!("<td><em>{}</em></td>", esc(text))
}

pub fn td_colored(text: &str, color: &str) -> String {
    format!(
        r#"<td style="color:{};font-weight:bold;">{}</td>"#,
        attr(color),
        esc(text)
    )
}

/// Look `key` up in a (value, color) palette.
pub fn color_for<'a>(key: &str, palette: &[(&str, &'a str)], fallback: &'a str) -> &'a str {
    palette
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, c)| *c)
        .unwrap_or(fallback)
}

/// Table with a header row; rows hold already-rendered `<td>` cells.
pub fn table(headers: &[&str], rows: &[Vec<String>], full_width: bool) -> String {
    let mut out = String::from(if full_width { WIDE_TABLE_OPEN } else { TABLE_OPEN });
    out.push_str("\n<tr>");
    for h in headers {
        out.push_str(&format!("<th>{}</th>", esc(h)));
    }
    out.push_str("</tr>");
    for row in rows {
        out.push_str("\n<tr>");
        for cell in row {
            out.push_str(cell);
        }
        out.push_str("</tr>");
    }
    out.push_str("\n</table>");
    out
}

/// Full HTML document: heading, summary paragraph, then pre-rendered sections.
pub fn page(heading: &str, summary_html: &str, sections: &str) -> String {
    format!(
        "<html><body>\n<h2>{}</h2>\n{}\n{}\n</body></html>",
        esc(heading),
        summary_html,
        sections
    )
}

pub fn paragraph(text: &str) -> String {
    format!("<p>{}</p>", esc(text))
}
