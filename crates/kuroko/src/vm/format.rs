//! `repr` and `str` rendering, with the `in_repr` re-entrancy guard for
//! cyclic containers.

use super::Vm;
use crate::{
    exception::RunResult,
    heap::{HeapData, HeapId},
    object::Special,
    value::Value,
};

impl Vm {
    /// `str(value)`: strings render raw, everything else defers to repr or
    /// a user `__str__`.
    pub fn value_str(&mut self, value: Value) -> RunResult<String> {
        if let Value::Ref(id) = value {
            if let HeapData::Str(s) = self.heap.get(id) {
                return Ok(s.as_str().to_owned());
            }
            if matches!(self.heap.get(id), HeapData::Instance(_)) {
                let class = self.class_of(value);
                if let Some(method) = self.class_slot(class, Special::Str) {
                    let result = self.call_value_and_run(method, &[value])?;
                    return self.value_str(result);
                }
            }
        }
        self.value_repr(value)
    }

    /// `repr(value)`. Containers re-entering themselves render `...`.
    pub fn value_repr(&mut self, value: Value) -> RunResult<String> {
        match value {
            Value::None => Ok("None".to_owned()),
            Value::Bool(true) => Ok("True".to_owned()),
            Value::Bool(false) => Ok("False".to_owned()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(format_float(f)),
            Value::NotImplemented => Ok("NotImplemented".to_owned()),
            Value::Kwargs(_) | Value::Handler(_) => Ok("<internal>".to_owned()),
            Value::Ref(id) => self.repr_object(id),
        }
    }

    fn repr_object(&mut self, id: HeapId) -> RunResult<String> {
        if self.heap.in_repr(id) {
            return Ok(match self.heap.get(id) {
                HeapData::List(_) => "[...]".to_owned(),
                HeapData::Dict(_) => "{...}".to_owned(),
                HeapData::Set(_) => "{...}".to_owned(),
                HeapData::Tuple(_) => "(...)".to_owned(),
                _ => "...".to_owned(),
            });
        }
        match self.heap.get(id) {
            HeapData::Str(s) => Ok(string_repr(s.as_str())),
            HeapData::Bytes(b) => Ok(bytes_repr(b.as_slice())),
            HeapData::Tuple(t) => {
                let items = t.items.to_vec();
                self.heap.set_in_repr(id, true);
                let result = self.repr_items(&items, "(", ")", items.len() == 1);
                self.heap.set_in_repr(id, false);
                result
            }
            HeapData::List(l) => {
                let items = l.items.clone();
                self.heap.set_in_repr(id, true);
                let result = self.repr_items(&items, "[", "]", false);
                self.heap.set_in_repr(id, false);
                result
            }
            HeapData::Set(s) => {
                if s.is_empty() {
                    return Ok("set()".to_owned());
                }
                let items: Vec<Value> = s.iter().collect();
                self.heap.set_in_repr(id, true);
                let result = self.repr_items(&items, "{", "}", false);
                self.heap.set_in_repr(id, false);
                result
            }
            HeapData::Dict(d) => {
                let pairs: Vec<(Value, Value)> = d.iter().collect();
                self.heap.set_in_repr(id, true);
                let result = (|| -> RunResult<String> {
                    let mut out = String::from("{");
                    for (i, (key, value)) in pairs.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.value_repr(*key)?);
                        out.push_str(": ");
                        out.push_str(&self.value_repr(*value)?);
                    }
                    out.push('}');
                    Ok(out)
                })();
                self.heap.set_in_repr(id, false);
                result
            }
            HeapData::Function(f) => Ok(format!("<function {}>", self.heap.str_value(f.name))),
            HeapData::Closure(c) => {
                let name = match self.heap.get(c.function) {
                    HeapData::Function(f) => self.heap.str_value(f.name),
                    _ => "?",
                };
                Ok(format!("<function {name}>"))
            }
            HeapData::Native(n) => Ok(format!("<built-in function {}>", n.name)),
            HeapData::BoundMethod(b) => {
                let method = b.method;
                let receiver = b.receiver;
                let name = match method {
                    Value::Ref(mid) => match self.heap.get(mid) {
                        HeapData::Native(n) => n.name.to_owned(),
                        HeapData::Closure(c) => match self.heap.get(c.function) {
                            HeapData::Function(f) => self.heap.str_value(f.name).to_owned(),
                            _ => "?".to_owned(),
                        },
                        _ => "?".to_owned(),
                    },
                    _ => "?".to_owned(),
                };
                let class = self.class_of(receiver);
                Ok(format!("<bound method {}.{name}>", self.class_name(class)))
            }
            HeapData::Class(c) => Ok(format!("<class '{}'>", self.heap.str_value(c.name))),
            HeapData::Generator(_) => Ok("<generator>".to_owned()),
            HeapData::Property(_) => Ok("<property>".to_owned()),
            HeapData::Upvalue(_) => Ok("<upvalue>".to_owned()),
            HeapData::Instance(instance) => {
                let class = instance.class;
                if class == self.base.module {
                    let name_key = self.heap.intern_string("__name__");
                    let name = match self.heap.get(id) {
                        HeapData::Instance(instance) => instance.fields.get(&name_key).copied(),
                        _ => None,
                    };
                    let name = match name {
                        Some(v) => self.value_str(v)?,
                        None => "?".to_owned(),
                    };
                    return Ok(format!("<module '{name}'>"));
                }
                if let Some(method) = self.class_slot(class, Special::Repr) {
                    self.heap.set_in_repr(id, true);
                    let result = self.call_value_and_run(method, &[Value::Ref(id)]);
                    self.heap.set_in_repr(id, false);
                    return self.value_str(result?);
                }
                Ok(format!("<{} object>", self.class_name(class)))
            }
        }
    }

    fn repr_items(&mut self, items: &[Value], open: &str, close: &str, trailing_comma: bool) -> RunResult<String> {
        let mut out = String::from(open);
        for (i, &item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.value_repr(item)?);
        }
        if trailing_comma {
            out.push(',');
        }
        out.push_str(close);
        Ok(out)
    }
}

/// Floats always render with a decimal point or exponent, the way the
/// language prints them.
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    let mut buffer = ryu::Buffer::new();
    buffer.format(f).to_owned()
}

/// Single-quoted repr with the scanner's escape set.
pub(crate) fn string_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{1b}' => out.push_str("\\["),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

pub(crate) fn bytes_repr(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &byte in data {
        match byte {
            b'\'' => out.push_str("\\'"),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(char::from(byte)),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_repr_keeps_a_point() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(2.5), "2.5");
        assert_eq!(format_float(f64::NAN), "nan");
    }

    #[test]
    fn string_repr_escapes() {
        assert_eq!(string_repr("a'b"), "'a\\'b'");
        assert_eq!(string_repr("line\n"), "'line\\n'");
    }

    #[test]
    fn bytes_repr_escapes() {
        assert_eq!(bytes_repr(b"ab\x00"), "b'ab\\x00'");
    }
}
