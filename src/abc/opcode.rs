//! Opcode table and instruction decoding.

use serde::Serialize;

use super::{Reader, Result};

/// Immediate operand shape of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    U8,
    U30,
    U30U30,
    S24,
    LookupSwitch,
    /// `debug`: u8, u30, u8, u30
    Debug,
}

macro_rules! opcodes {
    ($($name:ident = $byte:literal, $text:literal, $shape:ident;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $byte,)*
        }

        impl Opcode {
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => $text,)*
                }
            }

            pub fn operands(self) -> Operands {
                match self {
                    $(Opcode::$name => Operands::$shape,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x02, "nop", None;
    Throw = 0x03, "throw", None;
    GetSuper = 0x04, "getsuper", U30;
    SetSuper = 0x05, "setsuper", U30;
    Kill = 0x08, "kill", U30;
    Label = 0x09, "label", None;
    IfNlt = 0x0c, "ifnlt", S24;
    IfNle = 0x0d, "ifnle", S24;
    IfNgt = 0x0e, "ifngt", S24;
    IfNge = 0x0f, "ifnge", S24;
    Jump = 0x10, "jump", S24;
    IfTrue = 0x11, "iftrue", S24;
    IfFalse = 0x12, "iffalse", S24;
    IfEq = 0x13, "ifeq", S24;
    IfNe = 0x14, "ifne", S24;
    IfLt = 0x15, "iflt", S24;
    IfLe = 0x16, "ifle", S24;
    IfGt = 0x17, "ifgt", S24;
    IfGe = 0x18, "ifge", S24;
    IfStrictEq = 0x19, "ifstricteq", S24;
    IfStrictNe = 0x1a, "ifstrictne", S24;
    LookupSwitch = 0x1b, "lookupswitch", LookupSwitch;
    PopScope = 0x1d, "popscope", None;
    NextName = 0x1e, "nextname", None;
    HasNext = 0x1f, "hasnext", None;
    PushNull = 0x20, "pushnull", None;
    PushUndefined = 0x21, "pushundefined", None;
    NextValue = 0x23, "nextvalue", None;
    PushByte = 0x24, "pushbyte", U8;
    PushShort = 0x25, "pushshort", U30;
    PushTrue = 0x26, "pushtrue", None;
    PushFalse = 0x27, "pushfalse", None;
    PushNaN = 0x28, "pushnan", None;
    Pop = 0x29, "pop", None;
    Dup = 0x2a, "dup", None;
    Swap = 0x2b, "swap", None;
    PushString = 0x2c, "pushstring", U30;
    PushInt = 0x2d, "pushint", U30;
    PushUint = 0x2e, "pushuint", U30;
    PushDouble = 0x2f, "pushdouble", U30;
    PushScope = 0x30, "pushscope", None;
    PushNamespace = 0x31, "pushnamespace", U30;
    HasNext2 = 0x32, "hasnext2", U30U30;
    NewFunction = 0x40, "newfunction", U30;
    Call = 0x41, "call", U30;
    Construct = 0x42, "construct", U30;
    CallMethod = 0x43, "callmethod", U30U30;
    CallStatic = 0x44, "callstatic", U30U30;
    CallSuper = 0x45, "callsuper", U30U30;
    CallProperty = 0x46, "callproperty", U30U30;
    ReturnVoid = 0x47, "returnvoid", None;
    ReturnValue = 0x48, "returnvalue", None;
    ConstructSuper = 0x49, "constructsuper", U30;
    ConstructProp = 0x4a, "constructprop", U30U30;
    CallPropLex = 0x4c, "callproplex", U30U30;
    CallSuperVoid = 0x4e, "callsupervoid", U30U30;
    CallPropVoid = 0x4f, "callpropvoid", U30U30;
    NewObject = 0x55, "newobject", U30;
    NewArray = 0x56, "newarray", U30;
    NewActivation = 0x57, "newactivation", None;
    NewClass = 0x58, "newclass", U30;
    GetDescendants = 0x59, "getdescendants", U30;
    NewCatch = 0x5a, "newcatch", U30;
    FindPropStrict = 0x5d, "findpropstrict", U30;
    FindProperty = 0x5e, "findproperty", U30;
    GetLex = 0x60, "getlex", U30;
    SetProperty = 0x61, "setproperty", U30;
    GetLocal = 0x62, "getlocal", U30;
    SetLocal = 0x63, "setlocal", U30;
    GetGlobalScope = 0x64, "getglobalscope", None;
    GetScopeObject = 0x65, "getscopeobject", U30;
    GetProperty = 0x66, "getproperty", U30;
    InitProperty = 0x68, "initproperty", U30;
    DeleteProperty = 0x6a, "deleteproperty", U30;
    GetSlot = 0x6c, "getslot", U30;
    SetSlot = 0x6d, "setslot", U30;
    GetGlobalSlot = 0x6e, "getglobalslot", U30;
    SetGlobalSlot = 0x6f, "setglobalslot", U30;
    ConvertS = 0x70, "convert_s", None;
    ConvertI = 0x73, "convert_i", None;
    ConvertU = 0x74, "convert_u", None;
    ConvertD = 0x75, "convert_d", None;
    ConvertB = 0x76, "convert_b", None;
    ConvertO = 0x77, "convert_o", None;
    Coerce = 0x80, "coerce", U30;
    CoerceA = 0x82, "coerce_a", None;
    CoerceS = 0x85, "coerce_s", None;
    AsType = 0x86, "astype", U30;
    AsTypeLate = 0x87, "astypelate", None;
    Negate = 0x90, "negate", None;
    Increment = 0x91, "increment", None;
    IncLocal = 0x92, "inclocal", U30;
    Decrement = 0x93, "decrement", None;
    DecLocal = 0x94, "declocal", U30;
    TypeOf = 0x95, "typeof", None;
    Not = 0x96, "not", None;
    Add = 0xa0, "add", None;
    Subtract = 0xa1, "subtract", None;
    Multiply = 0xa2, "multiply", None;
    Divide = 0xa3, "divide", None;
    Modulo = 0xa4, "modulo", None;
    Equals = 0xab, "equals", None;
    StrictEquals = 0xac, "strictequals", None;
    LessThan = 0xad, "lessthan", None;
    LessEquals = 0xae, "lessequals", None;
    GreaterThan = 0xaf, "greaterthan", None;
    GreaterEquals = 0xb0, "greaterequals", None;
    InstanceOf = 0xb1, "instanceof", None;
    IsType = 0xb2, "istype", U30;
    IsTypeLate = 0xb3, "istypelate", None;
    In = 0xb4, "in", None;
    IncrementI = 0xc0, "increment_i", None;
    DecrementI = 0xc1, "decrement_i", None;
    IncLocalI = 0xc2, "inclocal_i", U30;
    DecLocalI = 0xc3, "declocal_i", U30;
    GetLocal0 = 0xd0, "getlocal_0", None;
    GetLocal1 = 0xd1, "getlocal_1", None;
    GetLocal2 = 0xd2, "getlocal_2", None;
    GetLocal3 = 0xd3, "getlocal_3", None;
    SetLocal0 = 0xd4, "setlocal_0", None;
    SetLocal1 = 0xd5, "setlocal_1", None;
    SetLocal2 = 0xd6, "setlocal_2", None;
    SetLocal3 = 0xd7, "setlocal_3", None;
    Debug = 0xef, "debug", Debug;
    DebugLine = 0xf0, "debugline", U30;
    DebugFile = 0xf1, "debugfile", U30;
}

/// Decoded immediates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Args {
    None,
    One(u32),
    Two(u32, u32),
    /// Branch displacement relative to the next instruction.
    Branch(i32),
    /// Displacements relative to the `lookupswitch` opcode itself.
    Switch { default: i32, cases: Vec<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    /// Offset of the following instruction.
    pub next: usize,
    pub byte: u8,
    /// `None` for bytes missing from the opcode table.
    pub opcode: Option<Opcode>,
    pub args: Args,
}

impl Instruction {
    /// Absolute branch target of an `S24` instruction.
    pub fn branch_target(&self) -> Option<usize> {
        match self.args {
            Args::Branch(disp) => Some((self.next as i64 + disp as i64) as usize),
            _ => None,
        }
    }

    /// Absolute targets of a `lookupswitch`, default first.
    pub fn switch_targets(&self) -> Vec<usize> {
        match &self.args {
            Args::Switch { default, cases } => std::iter::once(default)
                .chain(cases.iter())
                .map(|&d| (self.offset as i64 + d as i64) as usize)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Decodes the instruction at `offset`.
pub fn decode(code: &[u8], offset: usize) -> Result<Instruction> {
    let mut r = Reader::new(&code[offset.min(code.len())..]);
    let byte = r.read_u8()?;
    let opcode = Opcode::from_byte(byte);
    let args = match opcode.map(Opcode::operands).unwrap_or(Operands::None) {
        Operands::None => Args::None,
        Operands::U8 => Args::One(r.read_u8()? as u32),
        Operands::U30 => Args::One(r.read_u30()?),
        Operands::U30U30 => {
            let a = r.read_u30()?;
            Args::Two(a, r.read_u30()?)
        }
        Operands::S24 => Args::Branch(r.read_s24()?),
        Operands::LookupSwitch => {
            let default = r.read_s24()?;
            let count = r.read_u30()?;
            let mut cases = Vec::with_capacity(r.capacity_for(count as usize + 1));
            for _ in 0..=count {
                cases.push(r.read_s24()?);
            }
            Args::Switch { default, cases }
        }
        Operands::Debug => {
            r.read_u8()?;
            let name = r.read_u30()?;
            r.read_u8()?;
            Args::Two(name, r.read_u30()?)
        }
    };
    Ok(Instruction {
        offset,
        next: offset + r.position(),
        byte,
        opcode,
        args,
    })
}

/// Iterates over the instructions of a code stream, stopping at the first
/// truncated instruction.
pub fn instructions(code: &[u8]) -> impl Iterator<Item = Instruction> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset >= code.len() {
            return None;
        }
        let insn = decode(code, offset).ok()?;
        offset = insn.next;
        Some(insn)
    })
}
