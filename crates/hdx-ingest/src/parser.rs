//! Streaming reader for the health export document
//!
//! Yields `Record` and `Workout` elements one at a time from any `BufRead`
//! source. Only the element being collected (and its capped children) is
//! held in memory.

use crate::error::{ParseError, RecordError};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;
use tracing::{debug, warn};

/// Upper bound on nested elements kept per record (HRV beat lists, metadata)
pub const MAX_CHILD_ELEMENTS: usize = 512;

/// Element kinds the stream collects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Record,
    Workout,
}

impl RecordKind {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"Record" => Some(RecordKind::Record),
            b"Workout" => Some(RecordKind::Workout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Record => "Record",
            RecordKind::Workout => "Workout",
        }
    }
}

/// An element with its attributes in document order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<RawElement>,
}

impl RawElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Direct children with the given element name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a RawElement> {
        self.children.iter().filter(move |child| child.name == name)
    }
}

/// One collected element, not yet interpreted
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub kind: RecordKind,
    pub element: RawElement,
    /// Byte offset of the element's start tag
    pub position: u64,
}

impl RawRecord {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name)
    }

    /// Tag the router keys on: the `type` attribute of a `Record`, or
    /// `Workout` for workouts
    pub fn type_tag(&self) -> Option<&str> {
        match self.kind {
            RecordKind::Record => self.attr("type"),
            RecordKind::Workout => Some(RecordKind::Workout.as_str()),
        }
    }
}

/// Parser for export documents
#[derive(Debug, Clone, Default)]
pub struct ExportParser {
    /// Maximum number of records to yield (None for unlimited)
    limit: Option<usize>,
}

impl ExportParser {
    pub fn new() -> Self {
        Self { limit: None }
    }

    /// Stop after `limit` records
    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }

    pub fn stream<R: BufRead>(&self, source: R) -> RecordStream<R> {
        let mut reader = Reader::from_reader(source);
        let config = reader.config_mut();
        config.trim_text(true);
        config.check_end_names = false;
        config.expand_empty_elements = false;

        RecordStream {
            reader,
            buf: Vec::new(),
            limit: self.limit,
            yielded: 0,
            depth: 0,
            seen_element: false,
            building: Vec::new(),
            current: None,
            skip_depth: 0,
            child_budget: 0,
            dropped_children: 0,
            finished: false,
        }
    }
}

enum Step {
    Continue,
    Yield(Result<RawRecord, ParseError>),
    Done,
}

/// Lazy, forward-only sequence of records.
///
/// A `ParseError::Record` item means one element was skipped. A
/// `ParseError::Structural` item is always the last one.
pub struct RecordStream<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    limit: Option<usize>,
    yielded: usize,
    /// Open elements in the document
    depth: usize,
    seen_element: bool,
    /// Stack of elements being assembled; the bottom is the record itself
    building: Vec<RawElement>,
    current: Option<(RecordKind, u64)>,
    /// Open elements whose content is being discarded
    skip_depth: usize,
    child_budget: usize,
    dropped_children: u64,
    finished: bool,
}

impl<R: BufRead> RecordStream<R> {
    /// Nested elements discarded because a record hit the child cap
    pub fn dropped_children(&self) -> u64 {
        self.dropped_children
    }

    fn step(&mut self, buf: &mut Vec<u8>) -> Step {
        let position = self.reader.buffer_position() as u64;
        let event = match self.reader.read_event_into(buf) {
            Ok(event) => event,
            Err(err) => {
                let at = self.reader.error_position() as u64;
                return self.fail(at, err.to_string());
            },
        };

        match event {
            Event::Start(e) => {
                self.depth += 1;
                self.seen_element = true;
                self.open(&e, position, false)
            },
            Event::Empty(e) => {
                self.seen_element = true;
                self.open(&e, position, true)
            },
            Event::End(_) => {
                self.depth = self.depth.saturating_sub(1);
                self.close()
            },
            Event::Eof => self.end_of_document(position),
            _ => Step::Continue,
        }
    }

    fn open(&mut self, e: &BytesStart<'_>, position: u64, empty: bool) -> Step {
        if self.skip_depth > 0 {
            if !empty {
                self.skip_depth += 1;
            }
            return Step::Continue;
        }

        if !self.building.is_empty() {
            self.open_child(e, empty);
            return Step::Continue;
        }

        let Some(kind) = RecordKind::from_name(e.name().as_ref()) else {
            return Step::Continue;
        };

        match read_attributes(e) {
            Ok(attributes) => {
                let element = RawElement {
                    name: kind.as_str().to_string(),
                    attributes,
                    children: Vec::new(),
                };
                if empty {
                    self.emit(kind, element, position)
                } else {
                    self.building.push(element);
                    self.current = Some((kind, position));
                    self.child_budget = MAX_CHILD_ELEMENTS;
                    Step::Continue
                }
            },
            Err(message) => {
                warn!(position, element = kind.as_str(), %message, "Skipping malformed element");
                if !empty {
                    self.skip_depth = 1;
                }
                Step::Yield(Err(RecordError::Malformed { position, message }.into()))
            },
        }
    }

    fn open_child(&mut self, e: &BytesStart<'_>, empty: bool) {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();

        if self.child_budget == 0 {
            self.dropped_children += 1;
            if !empty {
                self.skip_depth = 1;
            }
            return;
        }

        let attributes = match read_attributes(e) {
            Ok(attributes) => attributes,
            Err(message) => {
                debug!(element = %name, %message, "Ignoring malformed nested element");
                if !empty {
                    self.skip_depth = 1;
                }
                return;
            },
        };

        self.child_budget -= 1;
        let child = RawElement {
            name,
            attributes,
            children: Vec::new(),
        };
        if empty {
            if let Some(parent) = self.building.last_mut() {
                parent.children.push(child);
            }
        } else {
            self.building.push(child);
        }
    }

    fn close(&mut self) -> Step {
        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return Step::Continue;
        }

        let Some(element) = self.building.pop() else {
            return Step::Continue;
        };
        if let Some(parent) = self.building.last_mut() {
            parent.children.push(element);
            return Step::Continue;
        }

        match self.current.take() {
            Some((kind, position)) => self.emit(kind, element, position),
            None => Step::Continue,
        }
    }

    fn emit(&mut self, kind: RecordKind, element: RawElement, position: u64) -> Step {
        self.yielded += 1;
        Step::Yield(Ok(RawRecord {
            kind,
            element,
            position,
        }))
    }

    fn end_of_document(&mut self, position: u64) -> Step {
        if !self.seen_element {
            return self.fail(position, "no XML elements found");
        }
        if self.depth > 0 || !self.building.is_empty() {
            let open = self.depth.max(self.building.len());
            return self.fail(
                position,
                format!("document truncated with {open} unclosed element(s)"),
            );
        }
        self.finished = true;
        Step::Done
    }

    fn fail(&mut self, position: u64, message: impl Into<String>) -> Step {
        self.finished = true;
        Step::Yield(Err(ParseError::structural(position, message)))
    }
}

impl<R: BufRead> Iterator for RecordStream<R> {
    type Item = Result<RawRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(limit) = self.limit {
            if self.yielded >= limit {
                debug!("Reached parse limit of {} records", limit);
                self.finished = true;
                return None;
            }
        }

        let mut buf = std::mem::take(&mut self.buf);
        let item = loop {
            buf.clear();
            match self.step(&mut buf) {
                Step::Continue => continue,
                Step::Yield(item) => break Some(item),
                Step::Done => break None,
            }
        };
        self.buf = buf;
        item
    }
}

fn read_attributes(e: &BytesStart<'_>) -> Result<Vec<(String, String)>, String> {
    e.attributes()
        .map(|attr| {
            let attr = attr.map_err(|err| err.to_string())?;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(|err| format!("attribute name is not UTF-8: {err}"))?
                .to_string();
            let value = attr
                .unescape_value()
                .map_err(|err| format!("attribute '{key}': {err}"))?
                .into_owned();
            Ok((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(xml: &str) -> Vec<Result<RawRecord, ParseError>> {
        ExportParser::new().stream(xml.as_bytes()).collect()
    }

    const EXPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE HealthData [
<!ELEMENT HealthData (ExportDate,Me,(Record|Workout)*)>
<!ATTLIST HealthData locale CDATA #REQUIRED>
]>
<HealthData locale="en_US">
 <ExportDate value="2023-02-01 10:00:00 +0000"/>
 <Me HKCharacteristicTypeIdentifierDateOfBirth="1990-01-01"/>
 <Record type="HKQuantityTypeIdentifierHeartRate" sourceName="iPhone" unit="count/min" startDate="2023-01-01 23:50:00 +0530" endDate="2023-01-01 23:50:00 +0530" value="72"/>
 <Record type="HKQuantityTypeIdentifierHeartRateVariabilitySDNN" sourceName="Apple Watch" unit="ms" startDate="2023-01-01 23:00:00 +0530" endDate="2023-01-01 23:01:00 +0530" value="41.5">
  <MetadataEntry key="HKMetadataKeyHeartRateMotionContext" value="0"/>
  <HeartRateVariabilityMetadataList>
   <InstantaneousBeatsPerMinute bpm="61" time="11:00:01.12 PM"/>
   <InstantaneousBeatsPerMinute bpm="63" time="11:00:02.05 PM"/>
  </HeartRateVariabilityMetadataList>
 </Record>
 <Correlation type="HKCorrelationTypeIdentifierBloodPressure" startDate="2023-01-02 08:00:00 +0000">
  <Record type="HKQuantityTypeIdentifierBloodPressureSystolic" sourceName="Omron" unit="mmHg" startDate="2023-01-02 08:00:00 +0000" value="120"/>
 </Correlation>
 <Workout workoutActivityType="HKWorkoutActivityTypeRunning" duration="30" durationUnit="min" sourceName="Apple Watch" startDate="2023-01-03 07:00:00 +0000" endDate="2023-01-03 07:30:00 +0000">
  <WorkoutStatistics type="HKQuantityTypeIdentifierActiveEnergyBurned" sum="250" unit="kcal"/>
  <WorkoutRoute sourceName="Apple Watch">
   <FileReference path="/workout-routes/route_2023-01-03.gpx"/>
  </WorkoutRoute>
 </Workout>
 <ActivitySummary dateComponents="2023-01-03" activeEnergyBurned="400"/>
</HealthData>
"#;

    #[test]
    fn test_collects_records_and_workouts() {
        let items = collect(EXPORT);
        assert_eq!(items.len(), 4);
        let records: Vec<RawRecord> = items.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(records[0].type_tag(), Some("HKQuantityTypeIdentifierHeartRate"));
        assert_eq!(records[0].attr("value"), Some("72"));

        let hrv = &records[1];
        assert_eq!(hrv.element.children.len(), 2);
        let list = hrv
            .element
            .children_named("HeartRateVariabilityMetadataList")
            .next()
            .unwrap();
        assert_eq!(list.children.len(), 2);
        assert_eq!(list.children[1].attr("bpm"), Some("63"));

        // Records nested in a correlation are still yielded
        assert_eq!(
            records[2].type_tag(),
            Some("HKQuantityTypeIdentifierBloodPressureSystolic")
        );

        let workout = &records[3];
        assert_eq!(workout.kind, RecordKind::Workout);
        assert_eq!(workout.type_tag(), Some("Workout"));
        let route = workout.element.children_named("WorkoutRoute").next().unwrap();
        assert_eq!(
            route.children[0].attr("path"),
            Some("/workout-routes/route_2023-01-03.gpx")
        );
    }

    #[test]
    fn test_attribute_escapes_are_decoded() {
        let xml = r#"<HealthData><Record type="T" sourceName="Jane&apos;s iPhone &amp; Co"/></HealthData>"#;
        let records = collect(xml);
        assert_eq!(
            records[0].as_ref().unwrap().attr("sourceName"),
            Some("Jane's iPhone & Co")
        );
    }

    #[test]
    fn test_malformed_elements_are_recoverable() {
        let xml = r#"<HealthData>
 <Record type="A" value="1"/>
 <Record type="B" value="2" value="3"/>
 <Record type="C" sourceName="bad &bogus; entity">
  <MetadataEntry key="k" value="v"/>
 </Record>
 <Record type="D" value="4"/>
</HealthData>"#;

        let items = collect(xml);
        assert_eq!(items.len(), 4);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1],
            Err(ParseError::Record(RecordError::Malformed { .. }))
        ));
        assert!(matches!(
            items[2],
            Err(ParseError::Record(RecordError::Malformed { .. }))
        ));
        assert_eq!(items[3].as_ref().unwrap().type_tag(), Some("D"));
    }

    #[test]
    fn test_truncated_document_is_structural() {
        let xml = r#"<HealthData>
 <Record type="A" value="1"/>
 <Record type="B" value="2">
  <MetadataEntry key="k" value="v"/>"#;

        let items = collect(xml);
        assert!(items[0].is_ok());
        assert!(matches!(items.last(), Some(Err(ParseError::Structural { .. }))));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_non_xml_is_structural() {
        let items = collect("this is not an export\n");
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ParseError::Structural { .. })));

        let items = collect("");
        assert!(matches!(items[0], Err(ParseError::Structural { .. })));
    }

    #[test]
    fn test_unclosed_tag_is_structural() {
        let items = collect(r#"<HealthData><Record type="A" value="1"#);
        assert!(matches!(items.last(), Some(Err(ParseError::Structural { .. }))));
    }

    #[test]
    fn test_parse_limit() {
        let records: Vec<_> = ExportParser::with_limit(2).stream(EXPORT.as_bytes()).collect();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_child_cap() {
        let mut xml = String::from(r#"<HealthData><Record type="A" value="1">"#);
        for i in 0..(MAX_CHILD_ELEMENTS + 10) {
            xml.push_str(&format!(r#"<MetadataEntry key="k{i}" value="v"/>"#));
        }
        xml.push_str("</Record></HealthData>");

        let mut stream = ExportParser::new().stream(xml.as_bytes());
        let record = stream.next().unwrap().unwrap();
        assert_eq!(record.element.children.len(), MAX_CHILD_ELEMENTS);
        assert!(stream.next().is_none());
        assert_eq!(stream.dropped_children(), 10);
    }
}
