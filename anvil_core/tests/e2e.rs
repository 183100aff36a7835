//! End-to-end pipeline tests: typed AST -> lowering -> linking -> direct
//! threading -> execution, the way a real frontend's output would flow
//! through every in-scope component together.

use anvil_core::ast::{BinOp, Expr, FunctionDecl, LocalId, TypedProgram};
use anvil_core::native::NativeTable;
use anvil_core::types::Type;
use anvil_core::{link, lower, preprocess, run, run_from};
use proptest::prelude::*;

fn run_single(decl: FunctionDecl) -> i64 {
    let typed = TypedProgram {
        functions: vec![decl],
    };
    let program = lower(&typed).unwrap();
    let natives = NativeTable::new();
    let executable = link(&program, &natives).unwrap();
    let direct = preprocess(&executable);
    let state = run(&direct).unwrap();
    state.ret_value() as i64
}

fn leaf_fn(name: &str, body: Expr) -> FunctionDecl {
    FunctionDecl {
        name: name.into(),
        params: vec![],
        return_ty: Type::I64,
        locals: vec![],
        body,
    }
}

#[test]
fn constant_return() {
    let decl = leaf_fn("main", Expr::lit_i64(42));
    assert_eq!(run_single(decl), 42);
}

#[test]
fn arithmetic_three_times_four_plus_two() {
    let body = Expr::BinOp {
        op: BinOp::Add,
        lhs: Box::new(Expr::BinOp {
            op: BinOp::Mul,
            lhs: Box::new(Expr::lit_i64(3)),
            rhs: Box::new(Expr::lit_i64(4)),
        }),
        rhs: Box::new(Expr::lit_i64(2)),
    };
    let decl = leaf_fn("main", body);
    assert_eq!(run_single(decl), 14);
}

#[test]
fn branching_picks_the_then_arm() {
    let body = Expr::If {
        cond: Box::new(Expr::BinOp {
            op: BinOp::Gt,
            lhs: Box::new(Expr::lit_i64(5)),
            rhs: Box::new(Expr::lit_i64(3)),
        }),
        then_branch: Box::new(Expr::lit_i64(1)),
        else_branch: Box::new(Expr::lit_i64(0)),
    };
    let decl = leaf_fn("main", body);
    assert_eq!(run_single(decl), 1);
}

#[test]
fn while_loop_counts_down_to_three() {
    let x = LocalId(0);
    let decl = FunctionDecl {
        name: "main".into(),
        params: vec![],
        return_ty: Type::I64,
        locals: vec![Type::I64],
        body: Expr::Block {
            decls: vec![x],
            body: vec![
                Expr::Let {
                    id: x,
                    value: Box::new(Expr::lit_i64(6)),
                },
                Expr::While {
                    cond: Box::new(Expr::BinOp {
                        op: BinOp::Gt,
                        lhs: Box::new(Expr::Local { id: x, ty: Type::I64 }),
                        rhs: Box::new(Expr::lit_i64(3)),
                    }),
                    body: Box::new(Expr::Assign {
                        id: x,
                        value: Box::new(Expr::BinOp {
                            op: BinOp::Sub,
                            lhs: Box::new(Expr::Local { id: x, ty: Type::I64 }),
                            rhs: Box::new(Expr::lit_i64(1)),
                        }),
                    }),
                },
                Expr::Local { id: x, ty: Type::I64 },
            ],
        },
    };
    assert_eq!(run_single(decl), 3);
}

#[test]
fn destructuring_a_four_tuple_sums_three_of_its_elements() {
    let (a, b, c, d) = (LocalId(0), LocalId(1), LocalId(2), LocalId(3));
    let decl = FunctionDecl {
        name: "main".into(),
        params: vec![],
        return_ty: Type::I64,
        locals: vec![Type::I64, Type::I64, Type::I64, Type::I64],
        body: Expr::Block {
            decls: vec![a, b, c, d],
            body: vec![
                Expr::Destructure {
                    value: Box::new(Expr::Tuple {
                        elements: vec![
                            Expr::lit_i64(1),
                            Expr::lit_i64(2),
                            Expr::lit_i64(3),
                            Expr::lit_i64(4),
                        ],
                        ty: Type::Tuple(vec![Type::I64, Type::I64, Type::I64, Type::I64]),
                    }),
                    targets: vec![Some(a), Some(b), Some(c), None],
                },
                Expr::BinOp {
                    op: BinOp::Add,
                    lhs: Box::new(Expr::BinOp {
                        op: BinOp::Add,
                        lhs: Box::new(Expr::Local { id: a, ty: Type::I64 }),
                        rhs: Box::new(Expr::Local { id: b, ty: Type::I64 }),
                    }),
                    rhs: Box::new(Expr::Local { id: c, ty: Type::I64 }),
                },
            ],
        },
    };
    assert_eq!(run_single(decl), 6);
}

#[test]
fn cross_function_call_targets_the_callees_linked_start() {
    let add = FunctionDecl {
        name: "add".into(),
        params: vec![Type::I64, Type::I64],
        return_ty: Type::I64,
        locals: vec![],
        body: Expr::BinOp {
            op: BinOp::Add,
            lhs: Box::new(Expr::Param { index: 0, ty: Type::I64 }),
            rhs: Box::new(Expr::Param { index: 1, ty: Type::I64 }),
        },
    };
    let main = FunctionDecl {
        name: "main".into(),
        params: vec![],
        return_ty: Type::I64,
        locals: vec![],
        body: Expr::Call {
            callee: "add".into(),
            args: vec![Expr::lit_i64(7), Expr::lit_i64(8)],
            native: false,
            result_ty: Type::I64,
        },
    };
    let typed = TypedProgram {
        functions: vec![add, main],
    };
    let program = lower(&typed).unwrap();
    let add_id = program.find_by_name("add").unwrap();
    let main_id = program.find_by_name("main").unwrap();

    let natives = NativeTable::new();
    let executable = link(&program, &natives).unwrap();

    let add_start = executable.function_starts()[add_id.0 as usize];
    let main_start = executable.function_starts()[main_id.0 as usize] as usize;

    // Find the CALL_UI64 inside main's linked body and check its target.
    let code = executable.code();
    let mut offset = main_start;
    let mut call_target = None;
    while code.has_instruction(offset) {
        let op = code.decode_opcode(offset).unwrap();
        if op == anvil_core::Opcode::CallUi64 {
            let bytes: [u8; 9] = code.read(offset);
            call_target = Some(u64::from_le_bytes(bytes[1..9].try_into().unwrap()));
            break;
        }
        offset += op.size_of() as usize;
    }
    assert_eq!(call_target, Some(add_start));

    let direct = preprocess(&executable);
    let entry = direct.function_starts()[main_id.0 as usize] as usize;
    let state = run_from(&direct, entry).unwrap();
    assert_eq!(state.ret_value() as i64, 15);
}

/// A small straight-line arithmetic tree, independent of [`Expr`] so the
/// host-side evaluator below can't accidentally share a bug with lowering.
#[derive(Clone, Debug)]
enum ArithExpr {
    Lit(i64),
    Add(Box<ArithExpr>, Box<ArithExpr>),
    Sub(Box<ArithExpr>, Box<ArithExpr>),
    Mul(Box<ArithExpr>, Box<ArithExpr>),
    Div(Box<ArithExpr>, Box<ArithExpr>),
}

impl ArithExpr {
    fn eval(&self) -> i64 {
        match self {
            ArithExpr::Lit(v) => *v,
            ArithExpr::Add(l, r) => l.eval().wrapping_add(r.eval()),
            ArithExpr::Sub(l, r) => l.eval().wrapping_sub(r.eval()),
            ArithExpr::Mul(l, r) => l.eval().wrapping_mul(r.eval()),
            ArithExpr::Div(l, r) => l.eval().wrapping_div(r.eval()),
        }
    }

    fn to_ast(&self) -> Expr {
        match self {
            ArithExpr::Lit(v) => Expr::lit_i64(*v),
            ArithExpr::Add(l, r) => Expr::BinOp {
                op: BinOp::Add,
                lhs: Box::new(l.to_ast()),
                rhs: Box::new(r.to_ast()),
            },
            ArithExpr::Sub(l, r) => Expr::BinOp {
                op: BinOp::Sub,
                lhs: Box::new(l.to_ast()),
                rhs: Box::new(r.to_ast()),
            },
            ArithExpr::Mul(l, r) => Expr::BinOp {
                op: BinOp::Mul,
                lhs: Box::new(l.to_ast()),
                rhs: Box::new(r.to_ast()),
            },
            ArithExpr::Div(l, r) => Expr::BinOp {
                op: BinOp::Div,
                lhs: Box::new(l.to_ast()),
                rhs: Box::new(r.to_ast()),
            },
        }
    }

    /// True if every `Div` subtree's divisor evaluates to a nonzero value, so
    /// the generated program never triggers a division-by-zero trap.
    fn never_divides_by_zero(&self) -> bool {
        match self {
            ArithExpr::Lit(_) => true,
            ArithExpr::Add(l, r) | ArithExpr::Sub(l, r) | ArithExpr::Mul(l, r) => {
                l.never_divides_by_zero() && r.never_divides_by_zero()
            }
            ArithExpr::Div(l, r) => {
                r.eval() != 0 && l.never_divides_by_zero() && r.never_divides_by_zero()
            }
        }
    }

    /// Leaves are small literals; `Div` nests against arbitrary
    /// sub-expressions and is filtered for zero divisors afterwards.
    fn strat() -> BoxedStrategy<ArithExpr> {
        let leaf = any::<i8>().prop_map(|v| ArithExpr::Lit(v as i64));
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone())
                    .prop_map(|(l, r)| ArithExpr::Add(Box::new(l), Box::new(r))),
                (inner.clone(), inner.clone())
                    .prop_map(|(l, r)| ArithExpr::Sub(Box::new(l), Box::new(r))),
                (inner.clone(), inner.clone())
                    .prop_map(|(l, r)| ArithExpr::Mul(Box::new(l), Box::new(r))),
                (inner.clone(), inner)
                    .prop_map(|(l, r)| ArithExpr::Div(Box::new(l), Box::new(r))),
            ]
        })
        .prop_filter("no division by zero", ArithExpr::never_divides_by_zero)
        .boxed()
    }
}

proptest! {
    #[test]
    fn arithmetic_expressions_match_a_host_evaluator(expr in ArithExpr::strat()) {
        let expected = expr.eval();
        let decl = leaf_fn("main", expr.to_ast());
        prop_assert_eq!(run_single(decl), expected);
    }
}
