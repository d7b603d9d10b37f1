//! Reference balance: random stack programs must leave every object with
//! the references it started with.

use std::io;
use std::rc::Rc;

use abcvm::abc::writer::{CodeBuilder, ProgramBuilder};
use abcvm::abc::{MethodBody, Opcode};
use abcvm::config::{JitMode, RuntimeConfig};
use abcvm::jit;
use abcvm::vm::{Frame, ObjRef, Object, Vm};

const LOCALS: u32 = 4;
const MAX_STACK: u32 = 8;

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, n: u32) -> u32 {
        self.next() % n
    }
}

/// Emits a random sequence of stack and local operations that never
/// underflows or exceeds `MAX_STACK`, then empties the stack.
fn random_body(rng: &mut Lcg, len: usize) -> MethodBody {
    let mut c = CodeBuilder::new();
    let mut depth = 0u32;
    for _ in 0..len {
        match rng.below(8) {
            0 | 1 if depth < MAX_STACK => {
                c.get_local(rng.below(LOCALS));
                depth += 1;
            }
            2 if depth > 0 => {
                c.set_local(1 + rng.below(LOCALS - 1));
                depth -= 1;
            }
            3 if depth > 0 && depth < MAX_STACK => {
                c.op(Opcode::Dup);
                depth += 1;
            }
            4 if depth > 0 => {
                c.op(Opcode::Pop);
                depth -= 1;
            }
            5 if depth >= 2 => {
                c.op(Opcode::Swap);
            }
            6 => {
                c.op_u30(Opcode::Kill, 1 + rng.below(LOCALS - 1));
            }
            7 if depth > 0 => {
                let n = 1 + rng.below(depth);
                c.op_u30(Opcode::NewArray, n);
                depth = depth - n + 1;
            }
            _ => {}
        }
    }
    if depth > 0 && rng.below(2) == 0 {
        depth -= 1;
        for _ in 0..depth {
            c.op(Opcode::Pop);
        }
        c.op(Opcode::ReturnValue);
    } else {
        for _ in 0..depth {
            c.op(Opcode::Pop);
        }
        c.op(Opcode::ReturnVoid);
    }
    MethodBody {
        max_stack: MAX_STACK,
        local_count: LOCALS,
        code: c.finish(),
        ..Default::default()
    }
}

fn vm() -> Vm {
    Vm::with_output(ProgramBuilder::new().finish(), RuntimeConfig::default(), Box::new(io::sink()))
}

fn assert_released(pool: &[ObjRef], context: &str) {
    for (i, obj) in pool.iter().enumerate() {
        assert_eq!(Rc::strong_count(obj), 1, "object {} leaked or over-released ({})", i, context);
    }
}

#[test]
fn test_random_programs_balance_references() {
    let vm = vm();
    let mut rng = Lcg(0x5eed);
    for round in 0..200 {
        let body = random_body(&mut rng, 40);
        let pool: Vec<ObjRef> = (0..LOCALS as i32).map(Object::integer).collect();
        for mode in [JitMode::Off, JitMode::Auto] {
            let code = jit::compile(&body, 0, mode).unwrap();
            {
                let mut frame = Frame::new(&vm, 0, MAX_STACK, LOCALS, pool[0].clone(), &pool[1..]);
                code.run(&mut frame);
                assert_eq!(frame.depth(), 0, "round {} {:?}", round, mode);
                drop(frame.result.take());
            }
            assert_released(&pool, &format!("round {} {:?}", round, mode));
        }
    }
}

#[test]
fn test_frame_drop_releases_locals_and_stack() {
    let vm = vm();
    let pool: Vec<ObjRef> = vec![Object::object(), Object::string("a"), Object::integer(3)];
    {
        let mut frame = Frame::new(&vm, 0, 4, 4, pool[0].clone(), &pool[1..]);
        frame.push(frame.local(1));
        frame.push(frame.local(2));
        frame.scope_stack.push(frame.this());
        assert_eq!(Rc::strong_count(&pool[1]), 3);
        assert_eq!(Rc::strong_count(&pool[0]), 3);
    }
    assert_released(&pool, "frame dropped");
}

#[test]
fn test_property_store_and_remove_balance() {
    let holder = Object::object();
    let value = Object::string("v");
    let mut rng = Lcg(7);
    let mut expected = 1;
    let names = ["a", "b", "c", "d"];
    for _ in 0..500 {
        let name = names[rng.below(names.len() as u32) as usize];
        let present = holder.has_property(name);
        if rng.below(2) == 0 {
            holder.set_property(name, value.clone());
            if !present {
                expected += 1;
            }
        } else if holder.remove_property(name) {
            expected -= 1;
        }
        assert_eq!(Rc::strong_count(&value), expected);
    }
    drop(holder);
    assert_eq!(Rc::strong_count(&value), 1);
}
