//! Output formatters
//!
//! The lookup endpoints stream their responses: a blocking worker walks
//! the index iterator and pushes formatted chunks through a channel that
//! backs the response body. The iterator only advances as the client
//! consumes output, so memory stays bounded regardless of result count,
//! and a dropped connection stops the walk at the next chunk.

use axum::body::{Body, Bytes};
use tokio::sync::mpsc;

use cdx_core::Capture;
use cdx_index::query::Field;
use cdx_index::IndexResult;

/// Incremental renderer for a stream of captures.
pub trait CaptureFormatter: Send {
    fn content_type(&self) -> &'static str;
    /// Emitted before the first row.
    fn begin(&mut self) -> String;
    fn row(&mut self, capture: &Capture) -> String;
    /// Emitted after the last row.
    fn end(&mut self) -> String;
}

/// WB-CDX `output=json`: a JSON array of arrays, first row the field
/// names.
pub struct JsonFormat {
    fields: Vec<Field>,
}

impl JsonFormat {
    pub fn new(fields: Vec<Field>) -> JsonFormat {
        JsonFormat { fields }
    }
}

impl CaptureFormatter for JsonFormat {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn begin(&mut self) -> String {
        let header: Vec<&str> = self.fields.iter().map(|f| f.name()).collect();
        format!("[{}", serde_json::json!(header))
    }

    fn row(&mut self, capture: &Capture) -> String {
        let values: Vec<serde_json::Value> =
            self.fields.iter().map(|f| f.json_value(capture)).collect();
        format!(",\n{}", serde_json::Value::from(values))
    }

    fn end(&mut self) -> String {
        "]\n".to_string()
    }
}

/// WB-CDX `output=text`: space-separated fields, one capture per line.
pub struct TextFormat {
    fields: Vec<Field>,
}

impl TextFormat {
    pub fn new(fields: Vec<Field>) -> TextFormat {
        TextFormat { fields }
    }
}

impl CaptureFormatter for TextFormat {
    fn content_type(&self) -> &'static str {
        "text/plain"
    }

    fn begin(&mut self) -> String {
        String::new()
    }

    fn row(&mut self, capture: &Capture) -> String {
        let values: Vec<String> = self
            .fields
            .iter()
            .map(|f| f.string_value(capture))
            .collect();
        let mut line = values.join(" ");
        line.push('\n');
        line
    }

    fn end(&mut self) -> String {
        String::new()
    }
}

/// OpenWayback XML query responses. The document header is deferred to
/// the first row so an empty result set can render the error document
/// instead.
pub struct XmlFormat {
    query_type: &'static str,
    urlkey: String,
    results_requested: usize,
    count: usize,
}

impl XmlFormat {
    pub fn new(query_type: &'static str, urlkey: String, results_requested: usize) -> XmlFormat {
        XmlFormat {
            query_type,
            urlkey,
            results_requested,
            count: 0,
        }
    }
}

impl CaptureFormatter for XmlFormat {
    fn content_type(&self) -> &'static str {
        "application/xml"
    }

    fn begin(&mut self) -> String {
        String::new()
    }

    fn row(&mut self, capture: &Capture) -> String {
        let mut out = String::new();
        if self.count == 0 {
            out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<wayback><request>");
            out.push_str(&format!("<type>{}</type>", self.query_type));
            out.push_str(&format!(
                "<url>{}</url>",
                xml_escape(&self.urlkey)
            ));
            out.push_str(&format!(
                "<resultsrequested>{}</resultsrequested>",
                self.results_requested
            ));
            out.push_str("<resultstype>resultstypecapture</resultstype>");
            out.push_str("</request><results>");
        }
        self.count += 1;
        out.push_str("<result>");
        out.push_str(&format!("<compressedoffset>{}</compressedoffset>", capture.offset));
        out.push_str(&format!("<mimetype>{}</mimetype>", xml_escape(&capture.mimetype)));
        out.push_str(&format!("<file>{}</file>", xml_escape(&capture.file)));
        out.push_str(&format!(
            "<redirecturl>{}</redirecturl>",
            xml_escape(&capture.redirecturl)
        ));
        out.push_str(&format!("<urlkey>{}</urlkey>", xml_escape(&capture.urlkey)));
        out.push_str(&format!("<digest>{}</digest>", xml_escape(&capture.digest)));
        out.push_str(&format!(
            "<httpresponsecode>{}</httpresponsecode>",
            capture.status
        ));
        out.push_str(&format!(
            "<robotflags>{}</robotflags>",
            xml_escape(&capture.robotflags)
        ));
        out.push_str(&format!("<url>{}</url>", xml_escape(&capture.original)));
        out.push_str(&format!("<capturedate>{:014}</capturedate>", capture.timestamp));
        out.push_str("</result>");
        out
    }

    fn end(&mut self) -> String {
        if self.count == 0 {
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<wayback><error>\
             <title>Resource Not In Archive</title>\
             <message>The URL or archive time requested is not in archive.</message>\
             </error></wayback>\n"
                .to_string()
        } else {
            "</results></wayback>\n".to_string()
        }
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Drive a capture iterator through a formatter on a blocking worker,
/// returning the streamed response body. A decode error halts iteration;
/// a dropped client stops the worker at its next send.
pub fn stream_captures<I>(iter: I, mut formatter: Box<dyn CaptureFormatter>) -> Body
where
    I: Iterator<Item = IndexResult<Capture>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(16);
    tokio::task::spawn_blocking(move || {
        if !send(&tx, formatter.begin()) {
            return;
        }
        for item in iter {
            match item {
                Ok(capture) => {
                    if !send(&tx, formatter.row(&capture)) {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "capture stream halted");
                    return;
                }
            }
        }
        send(&tx, formatter.end());
    });
    Body::from_stream(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

fn send(tx: &mpsc::Sender<Result<Bytes, std::convert::Infallible>>, chunk: String) -> bool {
    chunk.is_empty() || tx.blocking_send(Ok(Bytes::from(chunk))).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> Capture {
        Capture::from_cdx_line(
            "- 20200101000000 http://example.com/ text/html 200 DIGEST - - 1024 2048 a.warc.gz",
        )
        .unwrap()
    }

    #[test]
    fn test_json_format() {
        let mut fmt = JsonFormat::new(vec![Field::Urlkey, Field::Timestamp, Field::Statuscode]);
        let mut out = fmt.begin();
        out.push_str(&fmt.row(&capture()));
        out.push_str(&fmt.end());
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            serde_json::json!([
                ["urlkey", "timestamp", "statuscode"],
                ["com,example,:80:http:/", 20200101000000u64, 200]
            ]),
            parsed
        );
    }

    #[test]
    fn test_text_format() {
        let mut fmt = TextFormat::new(vec![Field::Original, Field::Filename]);
        assert_eq!("http://example.com/ a.warc.gz\n", fmt.row(&capture()));
    }

    #[test]
    fn test_xml_format_with_results() {
        let mut fmt = XmlFormat::new("urlquery", "com,example,:80:http:/".to_string(), 10);
        let mut out = fmt.begin();
        out.push_str(&fmt.row(&capture()));
        out.push_str(&fmt.end());
        assert!(out.starts_with("<?xml"));
        assert!(out.contains("<type>urlquery</type>"));
        assert!(out.contains("<capturedate>20200101000000</capturedate>"));
        assert!(out.contains("<httpresponsecode>200</httpresponsecode>"));
        assert!(out.ends_with("</results></wayback>\n"));
    }

    #[test]
    fn test_xml_format_empty_is_error_document() {
        let mut fmt = XmlFormat::new("urlquery", "key".to_string(), 10);
        let mut out = fmt.begin();
        out.push_str(&fmt.end());
        assert!(out.contains("Resource Not In Archive"));
        assert!(!out.contains("<results>"));
    }

    #[test]
    fn test_xml_escaping() {
        assert_eq!("a&amp;b&lt;c&gt;d&quot;e", xml_escape("a&b<c>d\"e"));
    }
}
