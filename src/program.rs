use bitflags::bitflags;
use slotmap::{new_key_type, SlotMap};
use strum::Display;

use crate::cfg::Ty;

new_key_type! {
    pub struct ClassId;
    pub struct FieldId;
    pub struct GlobalId;
    pub struct CalleeId;
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u8 {
        /// Instances are registered with the runtime on creation.
        const FINALIZER = 1 << 0;
        const THREAD = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub super_class: Option<ClassId>,
    /// All instance fields, inherited ones first.
    pub layout: Vec<FieldId>,
    pub flags: ClassFlags,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: Ty,
    pub holder: ClassId,
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub ty: Ty,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum ArgEffect {
    /// The callee may retain the reference past the call.
    Escapes,

    /// The callee only uses the reference for the duration of the call.
    Borrows,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalleeKind {
    /// An unresolved or virtual target: nothing is known about it.
    Opaque,
    Summarized(Vec<ArgEffect>),
}

#[derive(Debug, Clone)]
pub struct Callee {
    pub name: String,
    pub params: Vec<Ty>,
    pub ret: Option<Ty>,
    pub kind: CalleeKind,
}

impl Callee {
    pub fn arg_effect(&self, idx: usize) -> ArgEffect {
        match &self.kind {
            CalleeKind::Opaque => ArgEffect::Escapes,
            CalleeKind::Summarized(effects) => {
                effects.get(idx).copied().unwrap_or(ArgEffect::Escapes)
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Program {
    pub classes: SlotMap<ClassId, Class>,
    pub fields: SlotMap<FieldId, Field>,
    pub globals: SlotMap<GlobalId, Global>,
    pub callees: SlotMap<CalleeId, Callee>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(
        &mut self,
        name: &str,
        super_class: Option<ClassId>,
        fields: &[(&str, Ty)],
    ) -> ClassId {
        self.add_class_with_flags(name, super_class, fields, ClassFlags::empty())
    }

    pub fn add_class_with_flags(
        &mut self,
        name: &str,
        super_class: Option<ClassId>,
        fields: &[(&str, Ty)],
        flags: ClassFlags,
    ) -> ClassId {
        let mut layout = super_class
            .map(|super_class| self.classes[super_class].layout.clone())
            .unwrap_or_default();
        let flags = flags
            | super_class
                .map(|super_class| self.classes[super_class].flags)
                .unwrap_or_default();

        let class_id = self.classes.insert(Class {
            name: name.to_owned(),
            super_class,
            layout: vec![],
            flags,
        });

        for &(field_name, ty) in fields {
            layout.push(self.fields.insert(Field {
                name: field_name.to_owned(),
                ty,
                holder: class_id,
            }));
        }

        self.classes[class_id].layout = layout;

        class_id
    }

    /// Looks a field up by name, preferring the most derived declaration.
    pub fn field(&self, class_id: ClassId, name: &str) -> Option<FieldId> {
        self.classes[class_id]
            .layout
            .iter()
            .rev()
            .copied()
            .find(|&field_id| self.fields[field_id].name == name)
    }

    pub fn field_index(&self, class_id: ClassId, field_id: FieldId) -> Option<usize> {
        self.classes[class_id]
            .layout
            .iter()
            .position(|&id| id == field_id)
    }

    pub fn is_subclass(&self, mut sub: ClassId, sup: ClassId) -> bool {
        loop {
            if sub == sup {
                return true;
            }

            match self.classes[sub].super_class {
                Some(super_class) => sub = super_class,
                None => return false,
            }
        }
    }

    pub fn add_global(&mut self, name: &str, ty: Ty) -> GlobalId {
        self.globals.insert(Global {
            name: name.to_owned(),
            ty,
        })
    }

    pub fn add_callee(
        &mut self,
        name: &str,
        params: Vec<Ty>,
        ret: Option<Ty>,
        kind: CalleeKind,
    ) -> CalleeId {
        self.callees.insert(Callee {
            name: name.to_owned(),
            params,
            ret,
            kind,
        })
    }
}
