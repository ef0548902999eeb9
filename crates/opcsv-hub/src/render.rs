use chrono::SecondsFormat;
use opcsv_core::{escape_html, StatusCode as TriageStatus};
use opcsv_storage::{ReviewError, SessionView};
use std::fmt::Write;

pub struct InputEntry<'a> {
    pub name: &'a str,
    pub href: &'a str,
    pub has_derived: bool,
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html><head><meta charset='utf-8'><title>{}</title></head>\n<body>\n{}</body></html>\n",
        escape_html(title),
        body
    )
}

pub fn index_page(entries: &[InputEntry<'_>]) -> String {
    let mut body = String::from("<h1>Datasets</h1>\n<ul>\n");
    for entry in entries {
        let marker = if entry.has_derived { " (in review)" } else { "" };
        let _ = writeln!(
            body,
            "<li><a href='{}'>{}</a>{}</li>",
            escape_html(entry.href),
            escape_html(entry.name),
            marker
        );
    }
    body.push_str("</ul>\n");
    page("opcsv", &body)
}

pub fn record_page(view: &SessionView) -> String {
    let record = &view.record;
    let mut body = String::new();
    let _ = writeln!(
        body,
        "<h1>{}</h1>\n<p>Row {} &middot; opened {}</p>",
        escape_html(&view.name),
        record.position + 1,
        view.opened_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    body.push_str("<table>\n");
    for (column, value) in record.row.iter() {
        let _ = writeln!(
            body,
            "<tr><th>{}</th><td>{}</td></tr>",
            escape_html(column),
            escape_html(value)
        );
    }
    for annotation in &record.annotations {
        let rendered = if annotation.is_markup {
            annotation.format.clone()
        } else {
            escape_html(&annotation.format)
        };
        let _ = writeln!(
            body,
            "<tr class='annotation'><th>{}</th><td>{}</td></tr>",
            escape_html(&annotation.name),
            rendered
        );
    }
    body.push_str("</table>\n");

    for status in TriageStatus::ALL {
        let _ = writeln!(
            body,
            "<form method='post' action='/csv/status/{}' style='display:inline'><button>{}</button></form>",
            status.code(),
            status.label()
        );
    }
    body.push_str("<p><a href='/csv/next'>Next</a></p>\n");
    body.push_str("<form method='post' action='/csv/commit'><button>Save</button></form>\n");
    body.push_str("<form method='post' action='/csv/close'><button>Discard</button></form>\n");
    body.push_str("<p><a href='/'>Back</a></p>\n");
    page(&view.name, &body)
}

pub fn error_page(err: &ReviewError) -> String {
    let body = format!(
        "<h1>{}</h1>\n<p>{}</p>\n<p><a href='/'>Back</a></p>\n",
        escape_html(err.kind()),
        escape_html(&err.to_string())
    );
    page("opcsv error", &body)
}
