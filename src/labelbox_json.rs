use serde::de::{self, Deserializer, MapAccess, Visitor};
use std::fmt;
use std::io::Read;

use crate::types::{BoundingBox, LabelValue, LabelboxRecord};

/// Deserialize the `Label` field of a Labelbox record.
///
/// The field is either a bare string (the skip sentinel) or an object mapping class
/// names to lists of boxes. The object is walked entry by entry so class buckets keep
/// their file order.
pub fn deserialize_label<'de, D>(deserializer: D) -> Result<LabelValue, D::Error>
where
    D: Deserializer<'de>,
{
    struct LabelVisitor;

    impl<'de> Visitor<'de> for LabelVisitor {
        type Value = LabelValue;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("the string \"Skip\" or a map of class names to bounding boxes")
        }

        fn visit_str<E>(self, value: &str) -> Result<LabelValue, E>
        where
            E: de::Error,
        {
            Ok(LabelValue::Sentinel(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<LabelValue, E>
        where
            E: de::Error,
        {
            Ok(LabelValue::Sentinel(value))
        }

        fn visit_map<V>(self, mut map: V) -> Result<LabelValue, V::Error>
        where
            V: MapAccess<'de>,
        {
            let mut classes = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(class_name) = map.next_key::<String>()? {
                let boxes: Vec<BoundingBox> = map.next_value()?;
                classes.push((class_name, boxes));
            }
            Ok(LabelValue::Classes(classes))
        }
    }

    deserializer.deserialize_any(LabelVisitor)
}

/// Parse a whole Labelbox export (a JSON array of records) from a reader
pub fn read_labelbox_export<R: Read>(reader: R) -> serde_json::Result<Vec<LabelboxRecord>> {
    serde_json::from_reader(reader)
}
