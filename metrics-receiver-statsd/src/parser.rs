use std::{num::ParseFloatError, str};

use thiserror::Error;

use crate::metric::{Metric, MetricType, Tags};

/// Errors that could occur while parsing a StatsD line.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ParseError {
    /// The line has no `:` separating the bucket from the value.
    #[error("missing value delimiter ':'")]
    MissingValueDelimiter,

    /// The line has no `|` separating the value from the type.
    #[error("missing type delimiter '|'")]
    MissingTypeDelimiter,

    /// The value is not a valid floating-point number.
    #[error("invalid metric value {value:?}: {source}")]
    InvalidValue {
        /// The value text, as received.
        value: String,

        /// The underlying float parsing error.
        source: ParseFloatError,
    },

    /// The value is a valid number, but too large in magnitude to be represented as a finite `f64`.
    #[error("metric value {value:?} is out of range")]
    ValueOutOfRange {
        /// The value text, as received.
        value: String,
    },

    /// The type is not one of `c`, `g` or `ms`.
    #[error("unknown metric type {0:?}")]
    UnknownType(String),
}

/// Parses a single StatsD line into a [`Metric`].
///
/// The accepted format is `bucket[,key=value...]:value|type`, where `type` is one of `c`, `g` or `ms`. The line must
/// not include its terminating newline.
///
/// Tags are lenient: each comma-separated segment after the bucket is trimmed of surrounding whitespace and kept only
/// if it contains exactly one `=`. Anything else is silently dropped, and later duplicates replace earlier ones.
///
/// # Errors
///
/// If the `:` or `|` delimiters are missing, the value is not a valid float, or the type is not recognized, an error
/// is returned describing which part of the line was invalid.
pub fn parse_line(line: &[u8]) -> Result<Metric, ParseError> {
    let (bucket_and_tags, rest) = split_once(line, b':').ok_or(ParseError::MissingValueDelimiter)?;

    let mut segments = bucket_and_tags.split(|b| *b == b',');
    let bucket = segments.next().map(String::from_utf8_lossy).unwrap_or_default().into_owned();
    let tags = parse_tags(segments);

    let (raw_value, raw_type) = split_once(rest, b'|').ok_or(ParseError::MissingTypeDelimiter)?;
    let value = parse_value(raw_value)?;
    let metric_type = str::from_utf8(raw_type)
        .ok()
        .and_then(|s| s.parse::<MetricType>().ok())
        .ok_or_else(|| ParseError::UnknownType(String::from_utf8_lossy(raw_type).into_owned()))?;

    Ok(Metric { metric_type, bucket, value, tags })
}

fn split_once(buf: &[u8], delimiter: u8) -> Option<(&[u8], &[u8])> {
    memchr::memchr(delimiter, buf).map(|idx| (&buf[..idx], &buf[idx + 1..]))
}

fn parse_tags<'a, I>(segments: I) -> Tags
where
    I: Iterator<Item = &'a [u8]>,
{
    let mut tags = Tags::new();
    for segment in segments {
        let segment = segment.trim_ascii();

        // Exactly one `=` is required: `a=b=c` is dropped rather than being split on the first `=`.
        let mut parts = segment.split(|b| *b == b'=');
        if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
            tags.insert(String::from_utf8_lossy(key).into_owned(), String::from_utf8_lossy(value).into_owned());
        }
    }
    tags
}

fn parse_value(raw: &[u8]) -> Result<f64, ParseError> {
    let text = String::from_utf8_lossy(raw);
    let value = text.parse::<f64>().map_err(|source| ParseError::InvalidValue { value: text.to_string(), source })?;

    // Overflowing literals such as `1e400` parse as infinity, but only an explicit `inf` is accepted as one.
    if value.is_infinite() && !is_infinity_literal(&text) {
        return Err(ParseError::ValueOutOfRange { value: text.into_owned() });
    }
    Ok(value)
}

fn is_infinity_literal(text: &str) -> bool {
    let unsigned = text.strip_prefix(&['+', '-'][..]).unwrap_or(text);
    unsigned.eq_ignore_ascii_case("inf") || unsigned.eq_ignore_ascii_case("infinity")
}

#[cfg(test)]
mod tests {
    use proptest::{collection::btree_map as arb_btree_map, prelude::*, proptest};

    use super::{parse_line, ParseError};
    use crate::metric::{Metric, MetricType};

    #[test]
    fn valid_lines() {
        // Cases are defined as: input line, expected metric.
        let cases = [
            ("foo.bar.baz:2|c", Metric::new(MetricType::Counter, "foo.bar.baz", 2.0)),
            ("abc.def.g:3|g", Metric::new(MetricType::Gauge, "abc.def.g", 3.0)),
            ("def.g:10|ms", Metric::new(MetricType::Timer, "def.g", 10.0)),
            (
                "asdf,x=y,foo=bar:10|c",
                Metric::new(MetricType::Counter, "asdf", 10.0).with_tag("x", "y").with_tag("foo", "bar"),
            ),
            ("asdf,asdf,x=y:1|c", Metric::new(MetricType::Counter, "asdf", 1.0).with_tag("x", "y")),
            ("gorets:-0.25|g", Metric::new(MetricType::Gauge, "gorets", -0.25)),
            ("glork:1e3|ms", Metric::new(MetricType::Timer, "glork", 1000.0)),
        ];

        for (input, expected) in cases {
            let result = parse_line(input.as_bytes());
            assert_eq!(result, Ok(expected), "input: {}", input);
        }
    }

    #[test]
    fn invalid_lines() {
        assert_eq!(parse_line(b"fOO|bar:bazkk"), Err(ParseError::MissingTypeDelimiter));
        assert_eq!(parse_line(b"foo.bar.baz:1|q"), Err(ParseError::UnknownType("q".to_string())));
        assert_eq!(parse_line(b"foo.bar.baz"), Err(ParseError::MissingValueDelimiter));
        assert_eq!(parse_line(b"foo.bar.baz:1"), Err(ParseError::MissingTypeDelimiter));
        assert_eq!(parse_line(b"foo:1|"), Err(ParseError::UnknownType(String::new())));
        assert_eq!(parse_line(b"foo:1|c|@0.1"), Err(ParseError::UnknownType("c|@0.1".to_string())));
        assert_eq!(parse_line(b"foo:1|c\r"), Err(ParseError::UnknownType("c\r".to_string())));

        match parse_line(b"foo:bar|c") {
            Err(ParseError::InvalidValue { value, .. }) => assert_eq!(value, "bar"),
            other => panic!("expected invalid value error, got {:?}", other),
        }
        assert!(matches!(parse_line(b"foo:|c"), Err(ParseError::InvalidValue { .. })));
        assert_eq!(parse_line(b"foo:1e400|c"), Err(ParseError::ValueOutOfRange { value: "1e400".to_string() }));
        assert_eq!(parse_line(b"foo:-1e400|g"), Err(ParseError::ValueOutOfRange { value: "-1e400".to_string() }));
        assert!(matches!(parse_line(b"foo: 1|c"), Err(ParseError::InvalidValue { .. })));
    }

    #[test]
    fn lenient_tags() {
        // Cases are defined as: input line, expected tags.
        let cases: [(&str, &[(&str, &str)]); 6] = [
            ("foo:1|c", &[]),
            ("foo,:1|c", &[]),
            ("foo, x=y ,z=w:1|c", &[("x", "y"), ("z", "w")]),
            ("foo,a=b=c,d=e:1|c", &[("d", "e")]),
            ("foo,x=1,x=2:1|c", &[("x", "2")]),
            ("foo,=,k=:1|c", &[("", ""), ("k", "")]),
        ];

        for (input, expected) in cases {
            let metric = parse_line(input.as_bytes()).expect("line should parse");
            assert_eq!(metric.bucket, "foo", "input: {}", input);

            let tags = metric.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect::<Vec<_>>();
            let mut expected = expected.to_vec();
            expected.sort_unstable();
            assert_eq!(tags, expected, "input: {}", input);
        }
    }

    #[test]
    fn explicit_infinity_is_accepted() {
        // Cases are defined as: input line, expected value.
        let cases = [
            ("foo:inf|g", f64::INFINITY),
            ("foo:-Infinity|g", f64::NEG_INFINITY),
            ("foo:+INF|g", f64::INFINITY),
        ];

        for (input, expected) in cases {
            let metric = parse_line(input.as_bytes()).expect("line should parse");
            assert_eq!(metric.value, expected, "input: {}", input);
        }

        assert_eq!(parse_line(b"foo:1.7976931348623157e308|g").map(|m| m.value), Ok(f64::MAX));
    }

    #[test]
    fn bucket_segment_is_never_a_tag() {
        let metric = parse_line(b"a=b,x=y:1|c").expect("line should parse");
        assert_eq!(metric.bucket, "a=b");
        assert_eq!(metric.tags.len(), 1);
        assert_eq!(metric.tags.get("x").map(String::as_str), Some("y"));
    }

    #[test]
    fn empty_bucket_is_accepted() {
        let metric = parse_line(b":1|c").expect("line should parse");
        assert_eq!(metric.bucket, "");
    }

    #[test]
    fn non_utf8_text_is_decoded_lossily() {
        let metric = parse_line(b"fo\xffo,k=v\xfe:1|g").expect("line should parse");
        assert_eq!(metric.bucket, "fo\u{FFFD}o");
        assert_eq!(metric.tags.get("k").map(String::as_str), Some("v\u{FFFD}"));

        assert!(matches!(parse_line(b"foo:\xff|c"), Err(ParseError::InvalidValue { .. })));
        assert_eq!(parse_line(b"foo:1|\xff"), Err(ParseError::UnknownType("\u{FFFD}".to_string())));
    }

    fn arb_metric() -> impl Strategy<Value = Metric> {
        let metric_type = prop_oneof![
            Just(MetricType::Counter),
            Just(MetricType::Timer),
            Just(MetricType::Gauge),
        ];
        let tags = arb_btree_map("[a-z]{1,12}", "[a-zA-Z0-9_.]{0,16}", 0..4);

        (metric_type, "[a-zA-Z0-9_.]{1,32}", any::<f64>(), tags).prop_map(
            |(metric_type, bucket, value, tags)| Metric { metric_type, bucket, value, tags },
        )
    }

    proptest! {
        #[test]
        fn parse_is_deterministic(line in "[a-z.,=]{0,16}:[0-9.]{0,6}\\|(c|g|ms|x)") {
            prop_assert_eq!(parse_line(line.as_bytes()), parse_line(line.as_bytes()));
        }

        #[test]
        fn rendered_metric_parses_back(metric in arb_metric()) {
            let rendered = metric.to_string();
            let parsed = parse_line(rendered.as_bytes()).expect("rendered metric should parse");

            prop_assert_eq!(parsed.metric_type, metric.metric_type);
            prop_assert_eq!(&parsed.bucket, &metric.bucket);
            prop_assert_eq!(&parsed.tags, &metric.tags);
            if metric.value.is_nan() {
                prop_assert!(parsed.value.is_nan());
            } else {
                prop_assert_eq!(parsed.value, metric.value);
            }
        }
    }
}
