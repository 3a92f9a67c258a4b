//! A minimal hashed object, kept around purely to exercise the `Replica` facade's save/load
//! path in its own tests without reaching into `meshgraph_core`'s internal test fixtures.
use meshgraph_core::{DeliteralizedField, FieldValue, HashedObject, Result, Value};
use std::any::Any;

/// A single piece of free text, authored by nobody in particular.
#[derive(Clone)]
pub struct Note {
    id: Option<String>,
    text: String,
}

impl Note {
    /// Builds a note with no id yet assigned.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
        }
    }

    /// The note's text.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl HashedObject for Note {
    fn class_name(&self) -> &str {
        "Note"
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn fields(&self) -> Vec<(String, FieldValue)> {
        vec![("text".to_string(), FieldValue::Value(Value::from(self.text.as_str())))]
    }

    fn set_fields(&mut self, fields: Vec<(String, DeliteralizedField)>) -> Result<()> {
        for (name, field) in fields {
            if name == "text" {
                if let DeliteralizedField::Value(Value::Str(s)) = field {
                    self.text = s;
                }
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn HashedObject> {
        Box::new(self.clone())
    }
}
