use hashbrown::HashMap;
use slotmap::{new_key_type, SecondaryMap, SlotMap};

use crate::cfg::{Shape, Ty, Value};
use crate::program::{ClassId, GlobalId, Program};

new_key_type! {
    pub struct ObjRef;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtValue {
    Int(i32),
    Long(i64),
    Null,
    Ref(ObjRef),
    Class(ClassId),
}

impl RtValue {
    pub fn to_i32(self) -> Option<i32> {
        match self {
            Self::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_i64(self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(value.into()),
            Self::Long(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_ref(self) -> Option<ObjRef> {
        match self {
            Self::Ref(obj) => Some(obj),
            _ => None,
        }
    }

    /// Applies the store conversion of a slot typed `ty`.
    pub fn narrow(self, ty: Ty) -> Self {
        match (self, ty) {
            (Self::Int(_) | Self::Long(_), Ty::Byte | Ty::Short | Ty::Int | Ty::Long) => {
                let value = self.to_i64().unwrap_or_default();

                match ty {
                    Ty::Byte => Self::Int(value as i8 as i32),
                    Ty::Short => Self::Int(value as i16 as i32),
                    Ty::Int => Self::Int(value as i32),
                    _ => Self::Long(value),
                }
            }

            _ => self,
        }
    }
}

impl From<Value> for RtValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Int(value) => Self::Int(value),
            Value::Long(value) => Self::Long(value),
            Value::Null => Self::Null,
            Value::Class(class_id) => Self::Class(class_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub shape: Shape,
    pub fields: Vec<RtValue>,
    pub locks: u32,
}

impl Object {
    pub fn elem_ty(&self) -> Option<Ty> {
        match self.shape {
            Shape::Array { elem, .. } => Some(elem),
            Shape::Instance(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Heap {
    pub objects: SlotMap<ObjRef, Object>,
    pub globals: SecondaryMap<GlobalId, RtValue>,
    /// Objects created by executing allocation instructions.
    pub allocations: usize,
    /// Objects reconstructed from recipes during deoptimization.
    pub rematerialized: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, program: &Program, shape: Shape) -> ObjRef {
        let fields = match shape {
            Shape::Instance(class_id) => program.classes[class_id]
                .layout
                .iter()
                .map(|&field_id| program.fields[field_id].ty.default_value().into())
                .collect(),

            Shape::Array { elem, len } => vec![elem.default_value().into(); len as usize],
        };

        self.objects.insert(Object {
            shape,
            fields,
            locks: 0,
        })
    }

    pub fn global(&self, program: &Program, global_id: GlobalId) -> RtValue {
        self.globals
            .get(global_id)
            .copied()
            .unwrap_or_else(|| program.globals[global_id].ty.default_value().into())
    }

    /// Structural equality of `lhs` in `self` and `rhs` in `other`.
    ///
    /// Objects are matched up to a bijection, so aliasing and cycles must agree as well.
    pub fn equiv(&self, lhs: RtValue, other: &Heap, rhs: RtValue) -> bool {
        let mut forward = HashMap::<ObjRef, ObjRef>::new();
        let mut backward = HashMap::<ObjRef, ObjRef>::new();
        let mut stack = vec![(lhs, rhs)];

        while let Some((lhs, rhs)) = stack.pop() {
            let (lhs_obj, rhs_obj) = match (lhs, rhs) {
                (RtValue::Ref(lhs_obj), RtValue::Ref(rhs_obj)) => (lhs_obj, rhs_obj),
                (lhs, rhs) if lhs == rhs => continue,
                _ => return false,
            };

            match (forward.get(&lhs_obj), backward.get(&rhs_obj)) {
                (Some(&mapped), _) if mapped != rhs_obj => return false,
                (_, Some(&mapped)) if mapped != lhs_obj => return false,
                (Some(_), _) => continue,
                _ => {}
            }

            forward.insert(lhs_obj, rhs_obj);
            backward.insert(rhs_obj, lhs_obj);

            let (Some(lhs_obj), Some(rhs_obj)) = (self.objects.get(lhs_obj), other.objects.get(rhs_obj))
            else {
                return false;
            };

            if lhs_obj.shape != rhs_obj.shape
                || lhs_obj.locks != rhs_obj.locks
                || lhs_obj.fields.len() != rhs_obj.fields.len()
            {
                return false;
            }

            stack.extend(lhs_obj.fields.iter().copied().zip(rhs_obj.fields.iter().copied()));
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_program() -> (Program, ClassId) {
        let mut program = Program::new();
        let pair = program.add_class("Pair", None, &[("a", Ty::Ref), ("b", Ty::Int)]);

        (program, pair)
    }

    #[test]
    fn equiv_follows_cycles() {
        let (program, pair) = pair_program();
        let mut lhs = Heap::new();
        let mut rhs = Heap::new();

        let l = lhs.alloc(&program, Shape::Instance(pair));
        lhs.objects[l].fields[0] = RtValue::Ref(l);
        let r = rhs.alloc(&program, Shape::Instance(pair));
        rhs.objects[r].fields[0] = RtValue::Ref(r);

        assert!(lhs.equiv(RtValue::Ref(l), &rhs, RtValue::Ref(r)));

        rhs.objects[r].fields[1] = RtValue::Int(1);
        assert!(!lhs.equiv(RtValue::Ref(l), &rhs, RtValue::Ref(r)));
    }

    #[test]
    fn equiv_distinguishes_aliasing() {
        let (program, pair) = pair_program();
        let mut lhs = Heap::new();
        let mut rhs = Heap::new();

        // lhs: outer.a = inner, inner.a = inner
        let outer = lhs.alloc(&program, Shape::Instance(pair));
        let inner = lhs.alloc(&program, Shape::Instance(pair));
        lhs.objects[outer].fields[0] = RtValue::Ref(inner);
        lhs.objects[inner].fields[0] = RtValue::Ref(inner);

        // rhs: outer.a = outer
        let single = rhs.alloc(&program, Shape::Instance(pair));
        rhs.objects[single].fields[0] = RtValue::Ref(single);

        assert!(!lhs.equiv(RtValue::Ref(outer), &rhs, RtValue::Ref(single)));
    }

    #[test]
    fn equiv_compares_lock_counts() {
        let (program, pair) = pair_program();
        let mut lhs = Heap::new();
        let mut rhs = Heap::new();

        let l = lhs.alloc(&program, Shape::Instance(pair));
        let r = rhs.alloc(&program, Shape::Instance(pair));
        rhs.objects[r].locks = 1;

        assert!(!lhs.equiv(RtValue::Ref(l), &rhs, RtValue::Ref(r)));
    }

    #[test]
    fn narrowing_matches_slot_types() {
        assert_eq!(RtValue::Int(0x1ff).narrow(Ty::Byte), RtValue::Int(-1));
        assert_eq!(RtValue::Int(0x18000).narrow(Ty::Short), RtValue::Int(-32768));
        assert_eq!(RtValue::Long(1 << 40).narrow(Ty::Int), RtValue::Int(0));
        assert_eq!(RtValue::Null.narrow(Ty::Ref), RtValue::Null);
    }
}
