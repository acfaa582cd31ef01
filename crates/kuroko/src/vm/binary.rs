//! Binary and unary operator dispatch: fast paths for immediates and
//! builtin containers, then dunder methods with reflected fallback.

use super::Vm;
use crate::{
    exception::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    object::{Bytes, List, Set, Special, Tuple},
    value::{Value, value_eq},
};

impl Vm {
    pub(crate) fn op_binary(&mut self, special: Special) -> RunResult<()> {
        let b = self.pop();
        let a = self.pop();
        // Both operands leave the stack; keep them alive across dunder
        // dispatch into user code.
        self.protect(a);
        self.protect(b);
        let result = self.binary_dispatch(a, b, special);
        self.unprotect();
        self.unprotect();
        self.push(result?);
        Ok(())
    }

    /// Tries the builtin fast path, then `a.__op__(b)`, then the reflected
    /// `b.__rop__(a)`.
    pub(crate) fn binary_dispatch(&mut self, a: Value, b: Value, special: Special) -> RunResult<Value> {
        if let Some(result) = self.builtin_binary(a, b, special)? {
            return Ok(result);
        }
        let a_class = self.class_of(a);
        if let Some(method) = self.class_slot(a_class, special) {
            let result = self.call_value_and_run(method, &[a, b])?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
        if let Some(reflected) = special.reflected() {
            let b_class = self.class_of(b);
            if let Some(method) = self.class_slot(b_class, reflected) {
                let result = self.call_value_and_run(method, &[b, a])?;
                if !matches!(result, Value::NotImplemented) {
                    return Ok(result);
                }
            }
        }
        Err(ExcType::type_error(format!(
            "unsupported operand types for {}: '{}' and '{}'",
            operator_symbol(special),
            a.type_name(&self.heap),
            b.type_name(&self.heap)
        )))
    }

    /// Builtin operand handling; returns `None` when the pair needs dunder
    /// dispatch.
    fn builtin_binary(&mut self, a: Value, b: Value, special: Special) -> RunResult<Option<Value>> {
        // Integer fast path (bools promote to ints).
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int())
            && !matches!(a, Value::Float(_))
            && !matches!(b, Value::Float(_))
        {
            return self.int_binary(x, y, special);
        }
        // Mixed numeric promotes through f64.
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return self.float_binary(x, y, special);
        }
        let (Value::Ref(ia), Value::Ref(ib)) = (a, b) else {
            // str * int / list * int (either order) have one non-ref operand.
            if let (Value::Ref(id), Some(n)) = (a, b.as_int()) {
                return self.repeat_sequence(id, n, special);
            }
            if let (Some(n), Value::Ref(id)) = (a.as_int(), b) {
                return self.repeat_sequence(id, n, special);
            }
            return Ok(None);
        };
        match (self.heap.get(ia), self.heap.get(ib), special) {
            (HeapData::Str(x), HeapData::Str(y), Special::Add) => {
                let joined = format!("{}{}", x.as_str(), y.as_str());
                let id = self.heap.intern_string(&joined);
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::Bytes(x), HeapData::Bytes(y), Special::Add) => {
                let mut data = x.as_slice().to_vec();
                data.extend_from_slice(y.as_slice());
                let id = self.heap.allocate(HeapData::Bytes(Bytes::new(data)));
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::List(x), HeapData::List(y), Special::Add) => {
                let mut items = x.items.clone();
                items.extend_from_slice(&y.items);
                let id = self.heap.allocate(HeapData::List(List::new(items)));
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::Tuple(x), HeapData::Tuple(y), Special::Add) => {
                let mut items = x.items.to_vec();
                items.extend_from_slice(&y.items);
                let id = self.heap.allocate(HeapData::Tuple(Tuple::new(items)));
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::Set(_), HeapData::Set(_), Special::And | Special::Or | Special::Xor | Special::Sub) => {
                self.set_binary(ia, ib, special).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn int_binary(&mut self, x: i64, y: i64, special: Special) -> RunResult<Option<Value>> {
        let overflow = || ExcType::overflow("integer overflow");
        let value = match special {
            Special::Add => Value::Int(x.checked_add(y).ok_or_else(overflow)?),
            Special::Sub => Value::Int(x.checked_sub(y).ok_or_else(overflow)?),
            Special::Mul => Value::Int(x.checked_mul(y).ok_or_else(overflow)?),
            Special::Div => {
                if y == 0 {
                    return Err(ExcType::zero_division("division by zero"));
                }
                Value::Float(x as f64 / y as f64)
            }
            Special::FloorDiv => {
                if y == 0 {
                    return Err(ExcType::zero_division("integer division by zero"));
                }
                Value::Int(floor_div(x, y))
            }
            Special::Mod => {
                if y == 0 {
                    return Err(ExcType::zero_division("integer modulo by zero"));
                }
                Value::Int(floor_mod(x, y))
            }
            Special::Pow => {
                if y < 0 {
                    Value::Float((x as f64).powf(y as f64))
                } else {
                    let exp = u32::try_from(y).map_err(|_| ExcType::overflow("exponent too large"))?;
                    Value::Int(x.checked_pow(exp).ok_or_else(overflow)?)
                }
            }
            Special::And => Value::Int(x & y),
            Special::Or => Value::Int(x | y),
            Special::Xor => Value::Int(x ^ y),
            Special::Lshift => {
                if y < 0 {
                    return Err(ExcType::value_error("negative shift count"));
                }
                let shift = u32::try_from(y).map_err(|_| ExcType::overflow("shift count too large"))?;
                Value::Int(x.checked_shl(shift).ok_or_else(overflow)?)
            }
            Special::Rshift => {
                if y < 0 {
                    return Err(ExcType::value_error("negative shift count"));
                }
                let shift = u32::try_from(y).unwrap_or(63).min(63);
                Value::Int(x >> shift)
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn float_binary(&self, x: f64, y: f64, special: Special) -> RunResult<Option<Value>> {
        let value = match special {
            Special::Add => Value::Float(x + y),
            Special::Sub => Value::Float(x - y),
            Special::Mul => Value::Float(x * y),
            Special::Div => {
                if y == 0.0 {
                    return Err(ExcType::zero_division("float division by zero"));
                }
                Value::Float(x / y)
            }
            Special::FloorDiv => {
                if y == 0.0 {
                    return Err(ExcType::zero_division("float floor division by zero"));
                }
                Value::Float((x / y).floor())
            }
            Special::Mod => {
                if y == 0.0 {
                    return Err(ExcType::zero_division("float modulo by zero"));
                }
                let r = x % y;
                Value::Float(if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r })
            }
            Special::Pow => Value::Float(x.powf(y)),
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn repeat_sequence(&mut self, id: HeapId, n: i64, special: Special) -> RunResult<Option<Value>> {
        if special != Special::Mul {
            return Ok(None);
        }
        let count = usize::try_from(n.max(0)).unwrap_or(0);
        match self.heap.get(id) {
            HeapData::Str(s) => {
                let repeated = s.as_str().repeat(count);
                let out = self.heap.intern_string(&repeated);
                Ok(Some(Value::Ref(out)))
            }
            HeapData::List(l) => {
                let mut items = Vec::with_capacity(l.items.len() * count);
                for _ in 0..count {
                    items.extend_from_slice(&l.items);
                }
                let out = self.heap.allocate(HeapData::List(List::new(items)));
                Ok(Some(Value::Ref(out)))
            }
            HeapData::Tuple(t) => {
                let mut items = Vec::with_capacity(t.items.len() * count);
                for _ in 0..count {
                    items.extend_from_slice(&t.items);
                }
                let out = self.heap.allocate(HeapData::Tuple(Tuple::new(items)));
                Ok(Some(Value::Ref(out)))
            }
            _ => Ok(None),
        }
    }

    fn set_binary(&mut self, ia: HeapId, ib: HeapId, special: Special) -> RunResult<Value> {
        let left: Vec<Value> = match self.heap.get(ia) {
            HeapData::Set(s) => s.iter().collect(),
            _ => unreachable!("checked by caller"),
        };
        let mut out = Set::new();
        match special {
            Special::And => {
                for v in left {
                    let in_right = match self.heap.get(ib) {
                        HeapData::Set(s) => s.contains(&self.heap, v)?,
                        _ => unreachable!("checked by caller"),
                    };
                    if in_right {
                        out.add(&self.heap, v)?;
                    }
                }
            }
            Special::Sub => {
                for v in left {
                    let in_right = match self.heap.get(ib) {
                        HeapData::Set(s) => s.contains(&self.heap, v)?,
                        _ => unreachable!("checked by caller"),
                    };
                    if !in_right {
                        out.add(&self.heap, v)?;
                    }
                }
            }
            Special::Or => {
                for v in left {
                    out.add(&self.heap, v)?;
                }
                let right: Vec<Value> = match self.heap.get(ib) {
                    HeapData::Set(s) => s.iter().collect(),
                    _ => unreachable!("checked by caller"),
                };
                for v in right {
                    out.add(&self.heap, v)?;
                }
            }
            Special::Xor => {
                for v in left {
                    let in_right = match self.heap.get(ib) {
                        HeapData::Set(s) => s.contains(&self.heap, v)?,
                        _ => unreachable!("checked by caller"),
                    };
                    if !in_right {
                        out.add(&self.heap, v)?;
                    }
                }
                let right: Vec<Value> = match self.heap.get(ib) {
                    HeapData::Set(s) => s.iter().collect(),
                    _ => unreachable!("checked by caller"),
                };
                for v in right {
                    let in_left = match self.heap.get(ia) {
                        HeapData::Set(s) => s.contains(&self.heap, v)?,
                        _ => unreachable!("checked by caller"),
                    };
                    if !in_left {
                        out.add(&self.heap, v)?;
                    }
                }
            }
            _ => unreachable!("checked by caller"),
        }
        let id = self.heap.allocate(HeapData::Set(out));
        Ok(Value::Ref(id))
    }

    // ---- comparisons ----

    pub(crate) fn op_equal(&mut self) -> RunResult<()> {
        let b = self.pop();
        let a = self.pop();
        self.protect(a);
        self.protect(b);
        let equal = self.values_equal(a, b);
        self.unprotect();
        self.unprotect();
        self.push(Value::Bool(equal?));
        Ok(())
    }

    /// Equality with `__eq__` dispatch for instances, falling back to
    /// structural equality and finally identity.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> RunResult<bool> {
        let a_is_instance = matches!(a, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Instance(_)));
        let b_is_instance = matches!(b, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Instance(_)));
        if a_is_instance || b_is_instance {
            if a_is_instance {
                let class = self.class_of(a);
                if let Some(method) = self.class_slot(class, Special::Eq) {
                    let result = self.call_value_and_run(method, &[a, b])?;
                    if !matches!(result, Value::NotImplemented) {
                        return Ok(result.is_truthy(&self.heap));
                    }
                }
            }
            if b_is_instance {
                let class = self.class_of(b);
                if let Some(method) = self.class_slot(class, Special::Eq) {
                    let result = self.call_value_and_run(method, &[b, a])?;
                    if !matches!(result, Value::NotImplemented) {
                        return Ok(result.is_truthy(&self.heap));
                    }
                }
            }
            return Ok(a.is_same(b));
        }
        // Lists and sets compare structurally but may contain instances;
        // handle element-wise with recursion through values_equal.
        if let (Value::Ref(x), Value::Ref(y)) = (a, b) {
            match (self.heap.get(x), self.heap.get(y)) {
                (HeapData::List(p), HeapData::List(q)) => {
                    if p.items.len() != q.items.len() {
                        return Ok(false);
                    }
                    let pairs: Vec<(Value, Value)> =
                        p.items.iter().copied().zip(q.items.iter().copied()).collect();
                    for (l, r) in pairs {
                        if !self.values_equal(l, r)? {
                            return Ok(false);
                        }
                    }
                    return Ok(true);
                }
                (HeapData::Dict(p), HeapData::Dict(q)) => {
                    if p.len() != q.len() {
                        return Ok(false);
                    }
                    let pairs: Vec<(Value, Value)> = p.iter().collect();
                    for (key, value) in pairs {
                        let other = match self.heap.get(y) {
                            HeapData::Dict(q) => q.get(&self.heap, key)?,
                            _ => unreachable!("checked above"),
                        };
                        match other {
                            Some(other) => {
                                if !self.values_equal(value, other)? {
                                    return Ok(false);
                                }
                            }
                            None => return Ok(false),
                        }
                    }
                    return Ok(true);
                }
                (HeapData::Set(p), HeapData::Set(q)) => {
                    if p.len() != q.len() {
                        return Ok(false);
                    }
                    let elements: Vec<Value> = p.iter().collect();
                    for element in elements {
                        let contained = match self.heap.get(y) {
                            HeapData::Set(q) => q.contains(&self.heap, element)?,
                            _ => unreachable!("checked above"),
                        };
                        if !contained {
                            return Ok(false);
                        }
                    }
                    return Ok(true);
                }
                _ => {}
            }
        }
        Ok(value_eq(&self.heap, a, b))
    }

    pub(crate) fn op_compare(&mut self, special: Special) -> RunResult<()> {
        let b = self.pop();
        let a = self.pop();
        self.protect(a);
        self.protect(b);
        let result = self.compare_dispatch(a, b, special);
        self.unprotect();
        self.unprotect();
        let value = result?;
        self.push(value);
        Ok(())
    }

    fn compare_dispatch(&mut self, a: Value, b: Value, special: Special) -> RunResult<Value> {
        // Numeric cross-comparison is always direct.
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            let result = match special {
                Special::Lt => x < y,
                Special::Gt => x > y,
                Special::Le => x <= y,
                Special::Ge => x >= y,
                _ => unreachable!("comparison special"),
            };
            return Ok(Value::Bool(result));
        }
        if let (Value::Ref(x), Value::Ref(y)) = (a, b)
            && let (HeapData::Str(p), HeapData::Str(q)) = (self.heap.get(x), self.heap.get(y))
        {
            let ordering = p.as_str().cmp(q.as_str());
            let result = match special {
                Special::Lt => ordering.is_lt(),
                Special::Gt => ordering.is_gt(),
                Special::Le => ordering.is_le(),
                Special::Ge => ordering.is_ge(),
                _ => unreachable!("comparison special"),
            };
            return Ok(Value::Bool(result));
        }
        // Dunder dispatch with the mirrored operator as the reflection.
        let mirrored = match special {
            Special::Lt => Special::Gt,
            Special::Gt => Special::Lt,
            Special::Le => Special::Ge,
            Special::Ge => Special::Le,
            _ => unreachable!("comparison special"),
        };
        let a_class = self.class_of(a);
        if let Some(method) = self.class_slot(a_class, special) {
            let result = self.call_value_and_run(method, &[a, b])?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
        let b_class = self.class_of(b);
        if let Some(method) = self.class_slot(b_class, mirrored) {
            let result = self.call_value_and_run(method, &[b, a])?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' not supported between '{}' and '{}'",
            operator_symbol(special),
            a.type_name(&self.heap),
            b.type_name(&self.heap)
        )))
    }

    pub(crate) fn op_contains(&mut self) -> RunResult<()> {
        let container = self.pop();
        let needle = self.pop();
        self.protect(container);
        self.protect(needle);
        let result = self.value_contains(container, needle);
        self.unprotect();
        self.unprotect();
        self.push(Value::Bool(result?));
        Ok(())
    }

    pub(crate) fn value_contains(&mut self, container: Value, needle: Value) -> RunResult<bool> {
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::Str(s) => {
                    let Value::Ref(needle_id) = needle else {
                        return Err(ExcType::type_error("'in <string>' requires a string operand"));
                    };
                    let HeapData::Str(sub) = self.heap.get(needle_id) else {
                        return Err(ExcType::type_error("'in <string>' requires a string operand"));
                    };
                    return Ok(s.as_str().contains(sub.as_str()));
                }
                HeapData::List(l) => {
                    let items: Vec<Value> = l.items.clone();
                    for item in items {
                        if self.values_equal(needle, item)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                HeapData::Tuple(t) => {
                    let items: Vec<Value> = t.items.to_vec();
                    for item in items {
                        if self.values_equal(needle, item)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                HeapData::Dict(d) => return d.contains(&self.heap, needle),
                HeapData::Set(s) => return s.contains(&self.heap, needle),
                HeapData::Bytes(b) => {
                    let Some(byte) = needle.as_int() else {
                        return Err(ExcType::type_error("'in <bytes>' requires an integer"));
                    };
                    let Ok(byte) = u8::try_from(byte) else {
                        return Err(ExcType::value_error("byte must be in range(0, 256)"));
                    };
                    return Ok(b.as_slice().contains(&byte));
                }
                HeapData::Instance(_) => {
                    let class = self.class_of(container);
                    if let Some(method) = self.class_slot(class, Special::Contains) {
                        let result = self.call_value_and_run(method, &[container, needle])?;
                        return Ok(result.is_truthy(&self.heap));
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name(&self.heap)
        )))
    }

    // ---- unary ----

    pub(crate) fn op_negate(&mut self) -> RunResult<()> {
        let v = self.pop();
        match v {
            Value::Int(i) => {
                let negated = i.checked_neg().ok_or_else(|| ExcType::overflow("integer overflow"))?;
                self.push(Value::Int(negated));
            }
            Value::Bool(b) => self.push(Value::Int(-i64::from(b))),
            Value::Float(f) => self.push(Value::Float(-f)),
            _ => {
                let class = self.class_of(v);
                let Some(method) = self.class_slot(class, Special::Neg) else {
                    return Err(ExcType::type_error(format!(
                        "bad operand type for unary -: '{}'",
                        v.type_name(&self.heap)
                    )));
                };
                let result = self.call_value_and_run(method, &[v])?;
                self.push(result);
            }
        }
        Ok(())
    }

    pub(crate) fn op_bit_negate(&mut self) -> RunResult<()> {
        let v = self.pop();
        match v.as_int() {
            Some(i) if !matches!(v, Value::Float(_)) => {
                self.push(Value::Int(!i));
                Ok(())
            }
            _ => {
                let class = self.class_of(v);
                let Some(method) = self.class_slot(class, Special::Invert) else {
                    return Err(ExcType::type_error(format!(
                        "bad operand type for unary ~: '{}'",
                        v.type_name(&self.heap)
                    )));
                };
                let result = self.call_value_and_run(method, &[v])?;
                self.push(result);
                Ok(())
            }
        }
    }

    pub(crate) fn op_inc(&mut self, delta: i64) -> RunResult<()> {
        let v = self.pop();
        self.protect(v);
        let result = self.binary_dispatch(v, Value::Int(delta), Special::Add);
        self.unprotect();
        self.push(result?);
        Ok(())
    }
}

/// Python floor division for word integers.
pub(crate) fn floor_div(x: i64, y: i64) -> i64 {
    let q = x.wrapping_div(y);
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) { q - 1 } else { q }
}

/// Python floor modulo for word integers: the result takes the divisor's
/// sign.
pub(crate) fn floor_mod(x: i64, y: i64) -> i64 {
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) { r + y } else { r }
}

fn operator_symbol(special: Special) -> &'static str {
    match special {
        Special::Add => "+",
        Special::Sub => "-",
        Special::Mul => "*",
        Special::Div => "/",
        Special::FloorDiv => "//",
        Special::Mod => "%",
        Special::Pow => "**",
        Special::And => "&",
        Special::Or => "|",
        Special::Xor => "^",
        Special::Lshift => "<<",
        Special::Rshift => ">>",
        Special::Lt => "<",
        Special::Gt => ">",
        Special::Le => "<=",
        Special::Ge => ">=",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_division_follows_python() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-7, -2), 3);
    }

    #[test]
    fn floor_modulo_takes_divisor_sign() {
        assert_eq!(floor_mod(7, 3), 1);
        assert_eq!(floor_mod(-7, 3), 2);
        assert_eq!(floor_mod(7, -3), -2);
        assert_eq!(floor_mod(-7, -3), -1);
    }
}
