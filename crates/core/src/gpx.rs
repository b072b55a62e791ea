//! GPX text extraction (out-of-scope collaborator per spec §1, narrow
//! interface only). `<trkpt>`, `<wpt>`, `<rtept>` elements are read by
//! attribute extraction of `lat`/`lon` in either order; elevation and time
//! children are ignored. Out-of-range coordinates are dropped and counted
//! rather than failing the whole parse (spec §4.8 "parse" stage).

use crate::geo::LatLng;

#[derive(Debug, Clone, Default)]
pub struct GpxParseResult {
    pub points: Vec<LatLng>,
    pub dropped_out_of_range: usize,
}

const ELEMENTS: [&str; 3] = ["trkpt", "wpt", "rtept"];

/// Scans `gpx` for the three point element kinds and extracts `lat`/`lon`
/// attributes regardless of order or quote style. Not a general XML
/// parser: nested/duplicate attributes beyond the first pair, namespaces,
/// and CDATA are not special-cased, matching the narrow "attribute
/// extraction" contract spec §4.8 describes.
pub fn parse_gpx(gpx: &str) -> GpxParseResult {
    let mut result = GpxParseResult::default();
    for element in ELEMENTS {
        for tag in find_tags(gpx, element) {
            let Some(lat) = find_attr(tag, "lat") else { continue };
            let Some(lon) = find_attr(tag, "lon") else { continue };
            let (Ok(lat), Ok(lon)) = (lat.parse::<f64>(), lon.parse::<f64>()) else { continue };
            let pos = LatLng::new(lat, lon);
            if pos.is_finite() && pos.in_range() {
                result.points.push(pos);
            } else {
                result.dropped_out_of_range += 1;
            }
        }
    }
    result
}

/// Returns the opening-tag substrings `<name ...>` or `<name .../>` for a
/// given element name, in document order.
fn find_tags<'a>(xml: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("<{name}");
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        // Require a boundary so `<trkptx>` doesn't match `<trkpt>`.
        if !after.starts_with(|c: char| c.is_whitespace() || c == '>' || c == '/') {
            rest = after;
            continue;
        }
        match rest[start..].find('>') {
            Some(end) => {
                out.push(&rest[start..start + end + 1]);
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Extracts the value of `attr="..."` or `attr='...'` from a tag slice.
fn find_attr<'a>(tag: &'a str, attr: &str) -> Option<&'a str> {
    let needle = format!("{attr}=");
    let mut search_from = 0;
    while let Some(rel) = tag[search_from..].find(&needle) {
        let pos = search_from + rel;
        // Ensure this is a standalone attribute, not a suffix (e.g. "lon"
        // inside some other attribute ending in "lon").
        let preceding_ok = tag[..pos]
            .chars()
            .last()
            .map(|c| c.is_whitespace())
            .unwrap_or(true);
        if !preceding_ok {
            search_from = pos + needle.len();
            continue;
        }
        let quote_start = pos + needle.len();
        let quote_char = tag[quote_start..].chars().next()?;
        if quote_char != '"' && quote_char != '\'' {
            search_from = quote_start;
            continue;
        }
        let value_start = quote_start + 1;
        let value_end = tag[value_start..].find(quote_char)? + value_start;
        return Some(&tag[value_start..value_end]);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_trkpt_regardless_of_attribute_order() {
        let gpx = r#"<gpx><trk><trkseg>
            <trkpt lat="41.0" lon="29.0"><ele>10</ele></trkpt>
            <trkpt lon="29.1" lat="41.1"></trkpt>
        </trkseg></trk></gpx>"#;
        let result = parse_gpx(gpx);
        assert_eq!(result.points.len(), 2);
        assert!((result.points[0].lat - 41.0).abs() < 1e-9);
        assert!((result.points[1].lat - 41.1).abs() < 1e-9);
    }

    #[test]
    fn extracts_wpt_and_rtept() {
        let gpx = r#"<gpx>
            <wpt lat="1.0" lon="2.0"/>
            <rte><rtept lat="3.0" lon="4.0"/></rte>
        </gpx>"#;
        let result = parse_gpx(gpx);
        assert_eq!(result.points.len(), 2);
    }

    #[test]
    fn drops_and_counts_out_of_range_coordinates() {
        let gpx = r#"<trkpt lat="200.0" lon="29.0"/><trkpt lat="41.0" lon="29.0"/>"#;
        let result = parse_gpx(gpx);
        assert_eq!(result.points.len(), 1);
        assert_eq!(result.dropped_out_of_range, 1);
    }

    #[test]
    fn ignores_elevation_and_time_children() {
        let gpx = r#"<trkpt lat="41.0" lon="29.0"><ele>123.4</ele><time>2024-01-01T00:00:00Z</time></trkpt>"#;
        let result = parse_gpx(gpx);
        assert_eq!(result.points.len(), 1);
    }
}
