//! x86-64 Code Generator for Dhad
//!
//! Lowers the AST to GNU-assembler AT&T-syntax text for Linux, System V
//! AMD64 calling convention. The emitted module is freestanding: it
//! carries its own `_start` entry stub and a `print_int` helper, and
//! talks to the kernel only through the `write` and `exit` syscalls.

use crate::ast::*;
use std::collections::HashMap;
use std::fmt::Write;
use thiserror::Error;

/// Registers carrying the first six integer arguments, in order.
const ARG_REGISTERS: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

/// Fixed per-function frame size in bytes: 32 eight-byte slots, a
/// multiple of 16. Statements always execute with balanced expression
/// pushes, and a call issued under an odd number of outstanding pushes
/// is padded by 8 bytes, so %rsp is 16-byte aligned at every call
/// instruction.
const FRAME_SIZE: i64 = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InternalError {
    #[error("InternalError: variable '{name}' has no stack slot in function '{function}'")]
    UnresolvedVariable { name: String, function: String },

    #[error("InternalError: function '{function}' needs more than {} bytes of locals", FRAME_SIZE)]
    FrameOverflow { function: String },

    #[error("InternalError: call to '{name}' with {count} arguments survived semantic analysis")]
    TooManyArguments { name: String, count: usize },
}

/// Map a source-level function name to a valid assembler symbol: `fn_`
/// prefix, ASCII alphanumerics and underscores kept, every other scalar
/// replaced by `_u<hex>`.
pub fn mangle(name: &str) -> String {
    let mut symbol = String::from("fn_");
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            symbol.push(ch);
        } else {
            write!(symbol, "_u{:x}", ch as u32).unwrap();
        }
    }
    symbol
}

/// Code generator state
pub struct CodeGen {
    /// Output assembly
    output: String,

    /// Block scopes mapping local names to %rbp offsets, innermost last
    scopes: Vec<HashMap<String, i64>>,

    /// Next free slot offset, reset per function
    next_offset: i64,

    /// Counter backing `.L<n>` labels, unique across the module
    label_counter: u32,

    /// Outstanding expression-evaluation pushes, for call-site alignment
    push_depth: usize,

    /// Name of the function being compiled, for diagnostics
    current_function: String,
}

impl CodeGen {
    pub fn new() -> Self {
        Self {
            output: String::new(),
            scopes: Vec::new(),
            next_offset: 0,
            label_counter: 0,
            push_depth: 0,
            current_function: String::new(),
        }
    }

    /// Generate a unique label
    fn new_label(&mut self) -> String {
        let label = format!(".L{}", self.label_counter);
        self.label_counter += 1;
        label
    }

    /// Emit a line of assembly
    fn emit(&mut self, line: &str) {
        writeln!(self.output, "{}", line).unwrap();
    }

    /// Emit a labeled line
    fn emit_label(&mut self, label: &str) {
        writeln!(self.output, "{}:", label).unwrap();
    }

    /// Compile a complete program into one assembly text buffer.
    pub fn compile(&mut self, program: &Program) -> Result<String, InternalError> {
        self.emit(".text");
        self.emit(".globl _start");
        self.emit("");

        // Entry stub: run the main function, hand its return value to
        // the exit syscall.
        self.emit_label("_start");
        self.emit(&format!("    call {}", mangle(ENTRY_FUNCTION)));
        self.emit("    movq %rax, %rdi");
        self.emit("    movq $60, %rax");
        self.emit("    syscall");

        self.emit_print_int();

        for func in &program.functions {
            self.compile_function(func)?;
        }

        Ok(self.output.clone())
    }

    fn compile_function(&mut self, func: &FuncDef) -> Result<(), InternalError> {
        self.current_function = func.name.clone();
        self.scopes.clear();
        self.scopes.push(HashMap::new());
        self.next_offset = 0;
        self.push_depth = 0;

        self.emit("");
        self.emit_label(&mangle(&func.name));
        self.emit("    pushq %rbp");
        self.emit("    movq %rsp, %rbp");
        self.emit(&format!("    subq ${}, %rsp", FRAME_SIZE));

        // Spill incoming argument registers into local slots so that
        // parameters and locals share one resolution path.
        for (i, param) in func.params.iter().enumerate() {
            let offset = self.allocate(&param.name)?;
            self.emit(&format!("    movq {}, {}(%rbp)", ARG_REGISTERS[i], offset));
        }

        self.compile_block(&func.body)?;

        // Synthetic epilogue in case control falls off the end.
        self.emit("    movq $0, %rax");
        self.emit_epilogue();

        Ok(())
    }

    fn emit_epilogue(&mut self) {
        self.emit("    movq %rbp, %rsp");
        self.emit("    popq %rbp");
        self.emit("    ret");
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), InternalError> {
        self.scopes.push(HashMap::new());
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    /// Reserve the next 8-byte slot for `name` in the innermost scope.
    /// Slots are never reused within a function, so offsets stay
    /// pairwise distinct even across sibling blocks.
    fn allocate(&mut self, name: &str) -> Result<i64, InternalError> {
        self.next_offset -= 8;
        if self.next_offset < -FRAME_SIZE {
            return Err(InternalError::FrameOverflow {
                function: self.current_function.clone(),
            });
        }
        self.scopes
            .last_mut()
            .expect("scope stack is never empty inside a function")
            .insert(name.to_string(), self.next_offset);
        Ok(self.next_offset)
    }

    fn lookup(&self, name: &str) -> Result<i64, InternalError> {
        for scope in self.scopes.iter().rev() {
            if let Some(&offset) = scope.get(name) {
                return Ok(offset);
            }
        }
        Err(InternalError::UnresolvedVariable {
            name: name.to_string(),
            function: self.current_function.clone(),
        })
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), InternalError> {
        match stmt {
            Stmt::VarDecl { name, init, .. } => {
                // The initializer is lowered before the name binds, so a
                // shadowing declaration reads the outer binding, matching
                // the analyzer.
                self.compile_expr(init)?;
                let offset = self.allocate(name)?;
                self.emit(&format!("    movq %rax, {}(%rbp)", offset));
            }
            Stmt::Assign { name, value, .. } => {
                self.compile_expr(value)?;
                let offset = self.lookup(name)?;
                self.emit(&format!("    movq %rax, {}(%rbp)", offset));
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                let else_label = self.new_label();
                let end_label = self.new_label();

                self.compile_expr(cond)?;
                self.emit("    cmpq $0, %rax");
                self.emit(&format!("    je {}", else_label));

                self.compile_block(then_block)?;
                self.emit(&format!("    jmp {}", end_label));

                self.emit_label(&else_label);
                if let Some(block) = else_block {
                    self.compile_block(block)?;
                }
                self.emit_label(&end_label);
            }
            Stmt::While { cond, body, .. } => {
                let head_label = self.new_label();
                let end_label = self.new_label();

                self.emit_label(&head_label);
                self.compile_expr(cond)?;
                self.emit("    cmpq $0, %rax");
                self.emit(&format!("    je {}", end_label));

                self.compile_block(body)?;
                self.emit(&format!("    jmp {}", head_label));
                self.emit_label(&end_label);
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit("    movq $0, %rax"),
                }
                self.emit_epilogue();
            }
            Stmt::Print { value, .. } => {
                self.compile_expr(value)?;
                self.emit("    movq %rax, %rdi");
                self.emit("    call print_int");
            }
            Stmt::Expr { expr, .. } => {
                self.compile_expr(expr)?;
            }
        }
        Ok(())
    }

    /// Lower an expression; the result ends up in %rax.
    fn compile_expr(&mut self, expr: &Expr) -> Result<(), InternalError> {
        match expr {
            Expr::IntLit(value, _) => {
                // movq only takes a sign-extended 32-bit immediate.
                if i32::try_from(*value).is_ok() {
                    self.emit(&format!("    movq ${}, %rax", value));
                } else {
                    self.emit(&format!("    movabsq ${}, %rax", value));
                }
            }
            Expr::Ident(name, _) => {
                let offset = self.lookup(name)?;
                self.emit(&format!("    movq {}(%rbp), %rax", offset));
            }
            Expr::Binary(left, op, right, _) => {
                self.compile_binary(left, *op, right)?;
            }
            Expr::Neg(inner, _) => {
                self.compile_expr(inner)?;
                self.emit("    negq %rax");
            }
            Expr::Call(name, args, _) => {
                self.compile_call(name, args)?;
            }
        }
        Ok(())
    }

    /// Lower `left op right` with the stack as the evaluation buffer:
    /// left lands in %rax, is pushed across the right operand, and the
    /// operator is applied with the right operand in %rcx.
    fn compile_binary(&mut self, left: &Expr, op: BinOp, right: &Expr) -> Result<(), InternalError> {
        self.compile_expr(left)?;
        self.emit("    pushq %rax");
        self.push_depth += 1;
        self.compile_expr(right)?;
        self.emit("    movq %rax, %rcx");
        self.emit("    popq %rax");
        self.push_depth -= 1;

        match op {
            BinOp::Add => self.emit("    addq %rcx, %rax"),
            BinOp::Sub => self.emit("    subq %rcx, %rax"),
            BinOp::Mul => self.emit("    imulq %rcx, %rax"),
            BinOp::Div => {
                self.emit("    cqto");
                self.emit("    idivq %rcx");
            }
            BinOp::Eq => self.compile_comparison("e"),
            BinOp::Neq => self.compile_comparison("ne"),
            BinOp::Lt => self.compile_comparison("l"),
            BinOp::Gt => self.compile_comparison("g"),
            BinOp::Le => self.compile_comparison("le"),
            BinOp::Ge => self.compile_comparison("ge"),
        }
        Ok(())
    }

    /// Comparison result is 0 or 1 in %rax.
    fn compile_comparison(&mut self, cc: &str) {
        self.emit("    cmpq %rcx, %rax");
        self.emit(&format!("    set{} %al", cc));
        self.emit("    movzbq %al, %rax");
    }

    /// Lower a call: arguments are evaluated left to right with each
    /// result pushed, then popped into the argument registers in
    /// reverse order so the pops pair with the pushes. A call under an
    /// odd number of outstanding expression pushes (a call in the right
    /// operand of a binary op) would see %rsp off a 16-byte boundary,
    /// so it is wrapped in an 8-byte pad.
    fn compile_call(&mut self, name: &str, args: &[Expr]) -> Result<(), InternalError> {
        if args.len() > ARG_REGISTERS.len() {
            return Err(InternalError::TooManyArguments {
                name: name.to_string(),
                count: args.len(),
            });
        }

        for arg in args {
            self.compile_expr(arg)?;
            self.emit("    pushq %rax");
            self.push_depth += 1;
        }
        for i in (0..args.len()).rev() {
            self.emit(&format!("    popq {}", ARG_REGISTERS[i]));
            self.push_depth -= 1;
        }

        let padded = self.push_depth % 2 == 1;
        if padded {
            self.emit("    subq $8, %rsp");
        }
        self.emit(&format!("    call {}", mangle(name)));
        if padded {
            self.emit("    addq $8, %rsp");
        }
        Ok(())
    }

    /// Emit the `print_int` runtime helper once per module. It converts
    /// the signed 64-bit value in %rdi to decimal ASCII in a stack
    /// buffer and writes it with a trailing newline to fd 1. The
    /// magnitude is divided as an unsigned quantity, so i64::MIN needs
    /// no special path after `negq`.
    fn emit_print_int(&mut self) {
        self.emit("");
        self.emit_label("print_int");
        self.emit("    pushq %rbp");
        self.emit("    movq %rsp, %rbp");
        self.emit("    subq $32, %rsp");
        self.emit("    movq %rdi, %rax");
        self.emit("    leaq -1(%rbp), %rsi");
        self.emit("    movb $10, (%rsi)");
        self.emit("    movq $10, %rcx");
        self.emit("    xorq %r8, %r8");
        self.emit("    testq %rax, %rax");
        self.emit("    jns .Lprint_digits");
        self.emit("    movq $1, %r8");
        self.emit("    negq %rax");
        self.emit_label(".Lprint_digits");
        self.emit("    xorq %rdx, %rdx");
        self.emit("    divq %rcx");
        self.emit("    addq $48, %rdx");
        self.emit("    decq %rsi");
        self.emit("    movb %dl, (%rsi)");
        self.emit("    testq %rax, %rax");
        self.emit("    jnz .Lprint_digits");
        self.emit("    testq %r8, %r8");
        self.emit("    jz .Lprint_write");
        self.emit("    decq %rsi");
        self.emit("    movb $45, (%rsi)");
        self.emit_label(".Lprint_write");
        self.emit("    movq %rbp, %rdx");
        self.emit("    subq %rsi, %rdx");
        self.emit("    movq $1, %rax");
        self.emit("    movq $1, %rdi");
        self.emit("    syscall");
        self.emit("    movq %rbp, %rsp");
        self.emit("    popq %rbp");
        self.emit("    ret");
    }
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::{parser, semantic};

    const MANGLED_MAIN: &str = "fn__u631_u626_u64a_u633_u64a_u629";

    fn gen(source: &str) -> String {
        let program = parser::parse(tokenize(source).unwrap()).unwrap();
        semantic::analyze(&program).unwrap();
        CodeGen::new().compile(&program).unwrap()
    }

    #[test]
    fn test_mangle_entry_function() {
        assert_eq!(mangle(ENTRY_FUNCTION), MANGLED_MAIN);
    }

    #[test]
    fn test_mangle_ascii_passthrough() {
        assert_eq!(mangle("main_2"), "fn_main_2");
    }

    #[test]
    fn test_mangle_mixed() {
        assert_eq!(mangle("ب1"), "fn__u6281");
    }

    #[test]
    fn test_literal_return() {
        let asm = gen("دالة رئيسية() { ارجع 42؛ }");
        assert!(asm.contains(&format!("{}:", MANGLED_MAIN)));
        assert!(asm.contains("    movq $42, %rax"));
        assert!(asm.contains("    movq %rbp, %rsp\n    popq %rbp\n    ret"));
    }

    #[test]
    fn test_module_layout() {
        let asm = gen("دالة رئيسية() { ارجع 0؛ }");
        let text = asm.find(".text").unwrap();
        let start = asm.find("_start:").unwrap();
        let print_int = asm.find("print_int:").unwrap();
        let main = asm.find(&format!("{}:", MANGLED_MAIN)).unwrap();
        assert!(text < start && start < print_int && print_int < main);
        assert!(asm.contains(".globl _start"));
        assert!(!asm.contains(".data"));
    }

    #[test]
    fn test_entry_stub_exits_with_main_result() {
        let asm = gen("دالة رئيسية() { ارجع 7؛ }");
        let stub = format!(
            "_start:\n    call {}\n    movq %rax, %rdi\n    movq $60, %rax\n    syscall",
            MANGLED_MAIN
        );
        assert!(asm.contains(&stub));
    }

    #[test]
    fn test_frame_setup() {
        let asm = gen("دالة رئيسية() { ارجع 0؛ }");
        assert!(asm.contains("    pushq %rbp\n    movq %rsp, %rbp\n    subq $256, %rsp"));
    }

    #[test]
    fn test_var_decl_and_load() {
        let asm = gen("دالة رئيسية() { متغير ن = 5؛ ارجع ن؛ }");
        assert!(asm.contains("    movq %rax, -8(%rbp)"));
        assert!(asm.contains("    movq -8(%rbp), %rax"));
    }

    #[test]
    fn test_params_spilled_in_order() {
        let asm = gen(
            "دالة جمع(ا، ب) { ارجع ا + ب؛ }\nدالة رئيسية() { ارجع جمع(1، 2)؛ }",
        );
        assert!(asm.contains("    movq %rdi, -8(%rbp)"));
        assert!(asm.contains("    movq %rsi, -16(%rbp)"));
    }

    #[test]
    fn test_binary_op_uses_stack() {
        let asm = gen("دالة رئيسية() { ارجع 1 + 2؛ }");
        assert!(asm.contains(
            "    pushq %rax\n    movq $2, %rax\n    movq %rax, %rcx\n    popq %rax\n    addq %rcx, %rax"
        ));
    }

    #[test]
    fn test_division_sign_extends() {
        let asm = gen("دالة رئيسية() { ارجع 7 / 2؛ }");
        assert!(asm.contains("    cqto\n    idivq %rcx"));
    }

    #[test]
    fn test_comparison_materializes_flag() {
        let asm = gen("دالة رئيسية() { ارجع 1 < 2؛ }");
        assert!(asm.contains("    cmpq %rcx, %rax\n    setl %al\n    movzbq %al, %rax"));
    }

    #[test]
    fn test_unary_minus() {
        let asm = gen("دالة رئيسية() { ارجع -5؛ }");
        assert!(asm.contains("    movq $5, %rax\n    negq %rax"));
    }

    #[test]
    fn test_large_literal_uses_movabs() {
        let asm = gen("دالة رئيسية() { ارجع 4294967296؛ }");
        assert!(asm.contains("    movabsq $4294967296, %rax"));
    }

    #[test]
    fn test_if_else_labels() {
        let asm = gen("دالة رئيسية() { اذا (1) { ارجع 1؛ } والا { ارجع 2؛ } }");
        assert!(asm.contains("    cmpq $0, %rax\n    je .L0"));
        assert!(asm.contains("    jmp .L1"));
        assert!(asm.contains("\n.L0:\n"));
        assert!(asm.contains("\n.L1:\n"));
    }

    #[test]
    fn test_while_shape() {
        let asm = gen("دالة رئيسية() { متغير ع = 0؛ بينما (ع < 3) { ع = ع + 1؛ } ارجع ع؛ }");
        let head = asm.find("\n.L0:\n").unwrap();
        let exit_jump = asm.find("    je .L1").unwrap();
        let back_jump = asm.find("    jmp .L0").unwrap();
        let end = asm.find("\n.L1:\n").unwrap();
        assert!(head < exit_jump && exit_jump < back_jump && back_jump < end);
    }

    #[test]
    fn test_branch_labels_defined_once() {
        let asm = gen(
            "دالة رئيسية() { اذا (1) { اطبع(1)؛ } والا { اطبع(2)؛ } بينما (0) { اطبع(3)؛ } ارجع 0؛ }",
        );
        for label in [".L0", ".L1", ".L2", ".L3"] {
            let definitions = asm
                .lines()
                .filter(|line| *line == format!("{}:", label))
                .count();
            assert_eq!(definitions, 1, "label {} defined {} times", label, definitions);
        }
    }

    #[test]
    fn test_call_pops_in_reverse() {
        let asm = gen(
            "دالة ف(ا، ب، ج) { ارجع ا؛ }\nدالة رئيسية() { ارجع ف(1، 2، 3)؛ }",
        );
        assert!(asm.contains("    popq %rdx\n    popq %rsi\n    popq %rdi\n    call fn__u641"));
    }

    #[test]
    fn test_shadowing_initializer_reads_outer_slot() {
        let asm = gen(
            "دالة ف(ن) { متغير ن = ن + 1؛ ارجع ن؛ }\nدالة رئيسية() { ارجع ف(5)؛ }",
        );
        // The initializer loads the parameter slot at -8; only then is
        // the shadowing slot at -16 bound and stored. The final return
        // reads the inner slot.
        let init_load = asm.find("    movq -8(%rbp), %rax").unwrap();
        let inner_store = asm.find("    movq %rax, -16(%rbp)").unwrap();
        assert!(init_load < inner_store);
        assert!(asm.contains("    movq -16(%rbp), %rax"));
    }

    #[test]
    fn test_call_in_binary_operand_is_padded() {
        let asm = gen(
            "دالة مضروب(ن) { اذا (ن <= 1) { ارجع 1؛ } ارجع ن * مضروب(ن - 1)؛ }\nدالة رئيسية() { ارجع مضروب(5)؛ }",
        );
        // The recursive call sits under one outstanding push, so %rsp
        // gets an 8-byte pad around it.
        assert!(asm.contains(
            "    subq $8, %rsp\n    call fn__u645_u636_u631_u648_u628\n    addq $8, %rsp"
        ));
        // The statement-level call in the entry function is not padded.
        assert!(asm.contains("    popq %rdi\n    call fn__u645_u636_u631_u648_u628\n"));
    }

    #[test]
    fn test_print_calls_helper() {
        let asm = gen("دالة رئيسية() { اطبع(29)؛ ارجع 0؛ }");
        assert!(asm.contains("    movq %rax, %rdi\n    call print_int"));
        assert_eq!(asm.matches("print_int:").count(), 1);
    }

    #[test]
    fn test_return_without_value_yields_zero() {
        let asm = gen("دالة رئيسية() { ارجع؛ }");
        assert!(asm.contains("    movq $0, %rax\n    movq %rbp, %rsp"));
    }

    #[test]
    fn test_pushes_pair_with_pops() {
        let asm = gen(
            "دالة مضروب(ن) { اذا (ن <= 1) { ارجع 1؛ } ارجع ن * مضروب(ن - 1)؛ }\nدالة رئيسية() { اطبع(مضروب(5))؛ ارجع 0؛ }",
        );
        // Frame pushes pair with one pop per epilogue on each path, so
        // only expression-level pushes are counted against their pops.
        let expr_pushes = asm.matches("pushq %rax").count();
        let frame_pops = asm.matches("popq %rbp").count();
        let total_pops = asm.matches("popq").count();
        assert_eq!(expr_pushes, total_pops - frame_pops);
    }

    #[test]
    fn test_deterministic_output() {
        let src = "دالة مضروب(ن) { اذا (ن <= 1) { ارجع 1؛ } ارجع ن * مضروب(ن - 1)؛ }\nدالة رئيسية() { اطبع(مضروب(5))؛ ارجع 0؛ }";
        assert_eq!(gen(src), gen(src));
    }

    #[test]
    fn test_shadowed_variable_gets_distinct_slot() {
        let asm = gen(
            "دالة رئيسية() { متغير س = 1؛ اذا (س) { متغير س = 2؛ اطبع(س)؛ } ارجع س؛ }",
        );
        // Outer س lives at -8, inner at -16; the final return reads the
        // outer slot again.
        assert!(asm.contains("    movq %rax, -16(%rbp)"));
        let last_load = asm.rfind("    movq -8(%rbp), %rax").unwrap();
        let inner_store = asm.find("    movq %rax, -16(%rbp)").unwrap();
        assert!(last_load > inner_store);
    }

    #[test]
    fn test_frame_overflow() {
        // 33 declarations exhaust the 32-slot frame. Semantic analysis
        // is skipped so the generator's own guard is what fires.
        let mut src = String::from("دالة رئيسية() {\n");
        for i in 0..33 {
            src.push_str(&format!("متغير v{} = {}؛\n", i, i));
        }
        src.push_str("ارجع 0؛ }");
        let program = parser::parse(tokenize(&src).unwrap()).unwrap();
        let err = CodeGen::new().compile(&program).unwrap_err();
        assert!(matches!(err, InternalError::FrameOverflow { .. }));
    }

    #[test]
    fn test_unresolved_variable_is_internal_error() {
        // Bypasses semantic analysis on purpose.
        let program = parser::parse(tokenize("دالة رئيسية() { ارجع س؛ }").unwrap()).unwrap();
        let err = CodeGen::new().compile(&program).unwrap_err();
        assert!(matches!(err, InternalError::UnresolvedVariable { .. }));
    }
}
