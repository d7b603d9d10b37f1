//! Helper table: the runtime functions compiled code calls.
//!
//! Every action helper has the shape `fn(&mut Frame, u32, u32)`. The native
//! backend reaches them through `extern "C"` trampolines taking the frame as
//! a raw pointer.

use crate::vm::ops;
pub use crate::vm::ops::{ActionFn, CondFn, SwitchFn};

#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
use crate::vm::Frame;

#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
use std::ffi::c_void;

/// Reborrows the frame handed to a trampoline.
///
/// # Safety
/// `frame` must come from the `&mut Frame` passed to the compiled method and
/// no other reference to that frame may be live.
#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
unsafe fn frame_from<'a>(frame: *mut c_void) -> &'a mut Frame<'a> {
    // SAFETY: upheld by the caller.
    unsafe { &mut *frame.cast::<Frame<'a>>() }
}

macro_rules! action_helpers {
    ($($name:ident => $func:path,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Helper {
            $($name,)*
        }

        impl Helper {
            pub fn action(self) -> ActionFn {
                match self {
                    $(Helper::$name => $func,)*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Helper::$name => stringify!($name),)*
                }
            }

            /// Address of the `extern "C" fn(*mut c_void, u32, u32)`
            /// trampoline.
            #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
            pub fn address(self) -> u64 {
                match self {
                    $(Helper::$name => {
                        extern "C" fn trampoline(frame: *mut c_void, a: u32, b: u32) {
                            // SAFETY: only called from native code holding the frame.
                            $func(unsafe { frame_from(frame) }, a, b)
                        }
                        trampoline as usize as u64
                    })*
                }
            }
        }
    };
}

action_helpers! {
    GetLocal => ops::get_local,
    SetLocal => ops::set_local,
    CopyLocal => ops::copy_local,
    Kill => ops::kill,
    Pop => ops::pop,
    Dup => ops::dup,
    Swap => ops::swap,
    PushNull => ops::push_null,
    PushUndefined => ops::push_undefined,
    PushTrue => ops::push_true,
    PushFalse => ops::push_false,
    PushNaN => ops::push_nan,
    PushByte => ops::push_byte,
    PushShort => ops::push_short,
    PushString => ops::push_string,
    PushInt => ops::push_int,
    PushUint => ops::push_uint,
    PushDouble => ops::push_double,
    PushScope => ops::push_scope,
    PopScope => ops::pop_scope,
    GetGlobalScope => ops::get_global_scope,
    GetScopeObject => ops::get_scope_object,
    Add => ops::add,
    Subtract => ops::subtract,
    Multiply => ops::multiply,
    Divide => ops::divide,
    IncLocalI => ops::inc_local_i,
    LessThan => ops::less_than,
    GreaterThan => ops::greater_than,
    UnaryStub => ops::unary_stub,
    BinaryStub => ops::binary_stub,
    Throw => ops::throw,
    NewCatch => ops::new_catch,
    NextValue => ops::next_value,
    ConstructSuper => ops::construct_super,
    SetSuper => ops::set_super,
    Trap => ops::trap,
    GetProperty => ops::get_property,
    SetProperty => ops::set_property,
    InitProperty => ops::init_property,
    DeleteProperty => ops::delete_property,
    GetSlot => ops::get_slot,
    SetSlot => ops::set_slot,
    FindProperty => ops::find_property,
    FindPropStrict => ops::find_prop_strict,
    GetLex => ops::get_lex,
    CallProperty => ops::call_property,
    CallPropVoid => ops::call_prop_void,
    CallSuper => ops::call_super,
    CallSuperVoid => ops::call_super_void,
    Call => ops::call,
    Construct => ops::construct,
    ConstructProp => ops::construct_prop,
    NewFunction => ops::new_function,
    NewObject => ops::new_object,
    NewArray => ops::new_array,
    NewActivation => ops::new_activation,
    NewClass => ops::new_class,
    HasNext2 => ops::has_next2,
    NextName => ops::next_name,
    ReturnValue => ops::return_value,
    ReturnLocal => ops::return_local,
}

macro_rules! cond_helpers {
    ($($name:ident => $func:path,)*) => {
        /// Branch conditions. Each consumes its operands from the stack.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Cond {
            $($name,)*
        }

        impl Cond {
            pub fn test(self) -> CondFn {
                match self {
                    $(Cond::$name => $func,)*
                }
            }

            /// Address of the `extern "C" fn(*mut c_void) -> bool`
            /// trampoline.
            #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
            pub fn address(self) -> u64 {
                match self {
                    $(Cond::$name => {
                        extern "C" fn trampoline(frame: *mut c_void) -> bool {
                            // SAFETY: only called from native code holding the frame.
                            $func(unsafe { frame_from(frame) })
                        }
                        trampoline as usize as u64
                    })*
                }
            }
        }
    };
}

cond_helpers! {
    True => ops::if_true,
    False => ops::if_false,
    Eq => ops::if_eq,
    Ne => ops::if_ne,
    StrictEq => ops::if_strict_eq,
    StrictNe => ops::if_strict_ne,
    Lt => ops::if_lt,
    Le => ops::if_le,
    Gt => ops::if_gt,
    Ge => ops::if_ge,
    Nlt => ops::if_nlt,
    Nle => ops::if_nle,
    Ngt => ops::if_ngt,
    Nge => ops::if_nge,
}

pub const LOOKUP_SWITCH: SwitchFn = ops::lookup_switch;

/// Address of the `extern "C" fn(*mut c_void, u32) -> u32` trampoline for
/// [`LOOKUP_SWITCH`].
#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
pub fn lookup_switch_address() -> u64 {
    extern "C" fn trampoline(frame: *mut c_void, case_count: u32) -> u32 {
        // SAFETY: only called from native code holding the frame.
        LOOKUP_SWITCH(unsafe { frame_from(frame) }, case_count)
    }
    trampoline as usize as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_names() {
        assert_eq!(Helper::GetLocal.name(), "GetLocal");
        assert_eq!(Helper::ReturnLocal.name(), "ReturnLocal");
    }

    #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
    #[test]
    fn test_trampolines_are_distinct() {
        assert_ne!(Helper::Add.address(), Helper::Subtract.address());
        assert_ne!(Cond::True.address(), Cond::False.address());
        assert_ne!(lookup_switch_address(), 0);
    }
}
