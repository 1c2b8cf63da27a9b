use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info};

use crate::domain::RawRecord;
use crate::error::{EtlError, Result};

/// Element names accepted as one transaction record. Exports from different
/// handset backup tools disagree on the wrapper element.
const RECORD_ELEMENTS: &[&str] = &["transaction", "sms", "record", "message"];

/// Parses a full XML export into raw records.
///
/// Parsing is all-or-nothing: a document that is not well-formed, or that
/// contains no recognizable transaction elements, fails the whole run with
/// `MalformedInput`. Missing child elements within a transaction never abort
/// the parse; they surface as `None` fields for downstream stages to judge.
/// Re-parsing the same bytes yields the same sequence.
pub struct XmlBatchParser;

impl XmlBatchParser {
    pub fn parse_bytes(bytes: &[u8]) -> Result<Vec<RawRecord>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| EtlError::MalformedInput(format!("input is not valid UTF-8: {e}")))?;
        Self::parse_str(text)
    }

    pub fn parse_str(text: &str) -> Result<Vec<RawRecord>> {
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);

        let mut records: Vec<RawRecord> = Vec::new();
        let mut current: Option<RawRecord> = None;
        // Name of the element that opened the current record, so a child
        // element that shares the name (e.g. <message> inside <message>) is
        // still handled as a field.
        let mut record_elem = String::new();
        let mut current_field: Option<String> = None;
        let mut field_text = String::new();
        let mut open_elements: usize = 0;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    open_elements += 1;
                    let name = element_name(e.name().as_ref());
                    if current.is_none() && RECORD_ELEMENTS.contains(&name.as_str()) {
                        let mut record = RawRecord {
                            index: records.len(),
                            ..Default::default()
                        };
                        Self::apply_attributes(&e, &mut record)?;
                        record_elem = name;
                        current = Some(record);
                    } else if current.is_some() && current_field.is_none() {
                        current_field = Some(name);
                        field_text.clear();
                    }
                    // Deeper nesting inside a field is ignored; only the
                    // field's direct text content is captured.
                }
                Ok(Event::Empty(e)) => {
                    let name = element_name(e.name().as_ref());
                    if current.is_none() && RECORD_ELEMENTS.contains(&name.as_str()) {
                        // Attribute-only record, e.g. <sms date=".." body=".."/>
                        let mut record = RawRecord {
                            index: records.len(),
                            ..Default::default()
                        };
                        Self::apply_attributes(&e, &mut record)?;
                        records.push(record);
                    }
                }
                Ok(Event::Text(t)) => {
                    if current.is_some() && current_field.is_some() {
                        let piece = t
                            .unescape()
                            .map_err(|e| EtlError::MalformedInput(e.to_string()))?;
                        field_text.push_str(&piece);
                    }
                }
                Ok(Event::CData(t)) => {
                    if current.is_some() && current_field.is_some() {
                        field_text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                    }
                }
                Ok(Event::End(e)) => {
                    open_elements = open_elements.saturating_sub(1);
                    let name = element_name(e.name().as_ref());
                    if let Some(record) = current.as_mut() {
                        if current_field.as_deref() == Some(name.as_str()) {
                            let value = field_text.trim();
                            if !value.is_empty() {
                                assign_field(record, &name, value);
                            }
                            current_field = None;
                        } else if current_field.is_none() && name == record_elem {
                            records.push(current.take().unwrap_or_default());
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(EtlError::MalformedInput(format!(
                        "XML error at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
            }
        }

        if open_elements > 0 || current.is_some() {
            return Err(EtlError::MalformedInput(
                "unexpected end of document: unclosed element".to_string(),
            ));
        }
        if records.is_empty() {
            return Err(EtlError::MalformedInput(format!(
                "no transaction elements found (expected one of {:?})",
                RECORD_ELEMENTS
            )));
        }

        info!(records = records.len(), "parsed XML batch");
        Ok(records)
    }

    fn apply_attributes(e: &BytesStart<'_>, record: &mut RawRecord) -> Result<()> {
        for attr in e.attributes() {
            let attr = attr.map_err(|e| EtlError::MalformedInput(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_lowercase();
            let value = attr
                .unescape_value()
                .map_err(|e| EtlError::MalformedInput(e.to_string()))?;
            let value = value.trim();
            if !value.is_empty() {
                assign_field(record, &key, value);
            }
        }
        Ok(())
    }
}

fn element_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_lowercase()
}

/// Routes a child element (or attribute) into the raw record. Each logical
/// field accepts the aliases observed across real exports; the first value
/// seen wins.
fn assign_field(record: &mut RawRecord, name: &str, value: &str) {
    let slot = match name {
        "id" | "transaction_id" | "ref" | "reference" => &mut record.id,
        "date" | "timestamp" | "time" | "created_at" => &mut record.date,
        "amount" | "value" | "sum" | "total" => &mut record.amount,
        "currency" | "ccy" => &mut record.currency,
        "phone" | "mobile" | "number" | "msisdn" => &mut record.phone,
        "sender" | "from" | "source" => &mut record.sender,
        "recipient" | "receiver" | "to" | "destination" => &mut record.receiver,
        "message" | "text" | "content" | "body" => &mut record.message,
        "status" | "state" | "result" => &mut record.status,
        "type" | "transaction_type" | "category" => &mut record.kind,
        "fee" | "charge" | "cost" => &mut record.fee,
        "balance" | "account_balance" => &mut record.balance,
        other => {
            debug!(field = other, "ignoring unrecognized field");
            return;
        }
    };
    if slot.is_none() {
        *slot = Some(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_child_elements_into_fields() {
        let xml = r#"
            <transactions>
                <transaction>
                    <id>TXN001</id>
                    <date>2024-01-15 14:30:00</date>
                    <amount>1,500.00</amount>
                    <phone>0781234567</phone>
                    <message>Payment received</message>
                    <status>SUCCESS</status>
                    <type>payment</type>
                </transaction>
            </transactions>
        "#;

        let records = XmlBatchParser::parse_str(xml).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id.as_deref(), Some("TXN001"));
        assert_eq!(r.date.as_deref(), Some("2024-01-15 14:30:00"));
        assert_eq!(r.amount.as_deref(), Some("1,500.00"));
        assert_eq!(r.phone.as_deref(), Some("0781234567"));
        assert_eq!(r.status.as_deref(), Some("SUCCESS"));
        assert_eq!(r.kind.as_deref(), Some("payment"));
    }

    #[test]
    fn missing_children_become_none_not_errors() {
        let xml = "<transactions><transaction><amount>20</amount></transaction></transactions>";
        let records = XmlBatchParser::parse_str(xml).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].id.is_none());
        assert!(records[0].date.is_none());
        assert_eq!(records[0].amount.as_deref(), Some("20"));
    }

    #[test]
    fn field_aliases_and_attributes_are_honored() {
        let xml = r#"
            <export>
                <sms reference="A-1" msisdn="+250784445555">
                    <body>You have received 2000 RWF</body>
                    <timestamp>2024-02-01T08:00:00</timestamp>
                </sms>
                <sms date="1705312200000" body="Cash out 500 RWF" />
            </export>
        "#;
        let records = XmlBatchParser::parse_str(xml).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_deref(), Some("A-1"));
        assert_eq!(records[0].phone.as_deref(), Some("+250784445555"));
        assert_eq!(
            records[0].message.as_deref(),
            Some("You have received 2000 RWF")
        );
        assert_eq!(records[1].date.as_deref(), Some("1705312200000"));
        assert_eq!(records[1].message.as_deref(), Some("Cash out 500 RWF"));
    }

    #[test]
    fn records_keep_source_order_and_index() {
        let xml = r#"
            <transactions>
                <transaction><id>a</id></transaction>
                <transaction><id>b</id></transaction>
                <transaction><id>c</id></transaction>
            </transactions>
        "#;
        let records = XmlBatchParser::parse_str(xml).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(records[2].index, 2);
    }

    #[test]
    fn unclosed_tag_is_fatal() {
        let xml = "<transactions><transaction><id>x</id></transaction>";
        let err = XmlBatchParser::parse_str(xml).unwrap_err();
        assert_eq!(err.kind(), "MalformedInputError");
    }

    #[test]
    fn mismatched_end_tag_is_fatal() {
        let xml = "<transactions><transaction><id>x</wrong></transaction></transactions>";
        assert!(XmlBatchParser::parse_str(xml).is_err());
    }

    #[test]
    fn document_without_transaction_elements_is_fatal() {
        let xml = "<inventory><item>widget</item></inventory>";
        let err = XmlBatchParser::parse_str(xml).unwrap_err();
        assert_eq!(err.kind(), "MalformedInputError");
    }

    #[test]
    fn reparsing_yields_the_same_sequence() {
        let xml = r#"
            <transactions>
                <transaction><id>a</id><amount>10</amount></transaction>
                <transaction><id>b</id><amount>20</amount></transaction>
            </transactions>
        "#;
        let first = XmlBatchParser::parse_str(xml).unwrap();
        let second = XmlBatchParser::parse_str(xml).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.amount, b.amount);
        }
    }
}
