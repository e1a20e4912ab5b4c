//! Semantic analysis for Dhad
//!
//! A single walk over the AST that validates scoping and call arity
//! before code generation. Variables live in a stack of block scopes;
//! a declaration is visible for the remainder of its block and in
//! nested blocks, and an inner declaration shadows an outer one.

use crate::ast::*;
use crate::lexer::Pos;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Calls pass arguments in registers only, which caps every function at
/// six parameters.
pub const MAX_PARAMS: usize = 6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SemanticError {
    #[error("UndefinedVariable: '{name}' is not defined at {pos}")]
    UndefinedVariable { name: String, pos: Pos },

    #[error("UndefinedFunction: '{name}' is not defined at {pos}")]
    UndefinedFunction { name: String, pos: Pos },

    #[error("ArityMismatch: '{name}' takes {expected} argument(s) but {found} were given at {pos}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
        pos: Pos,
    },

    #[error("DuplicateFunction: '{name}' is already defined at {pos}")]
    DuplicateFunction { name: String, pos: Pos },

    #[error("DuplicateVariable: '{name}' is already defined in this scope at {pos}")]
    DuplicateVariable { name: String, pos: Pos },

    #[error("TooManyParams: '{name}' has {count} parameters, at most {} are supported at {pos}", MAX_PARAMS)]
    TooManyParams {
        name: String,
        count: usize,
        pos: Pos,
    },

    #[error("MissingMain: program does not define a zero-parameter function named '{}'", ENTRY_FUNCTION)]
    MissingMain,
}

struct Analyzer {
    /// Function name to parameter count
    functions: HashMap<String, usize>,

    /// Innermost scope last
    scopes: Vec<HashSet<String>>,
}

/// Validate a parsed program. Returns the first violation found.
pub fn analyze(program: &Program) -> Result<(), SemanticError> {
    Analyzer {
        functions: HashMap::new(),
        scopes: Vec::new(),
    }
    .check_program(program)
}

impl Analyzer {
    fn check_program(&mut self, program: &Program) -> Result<(), SemanticError> {
        // First pass: collect signatures so calls can reference functions
        // defined later in the file.
        for func in &program.functions {
            if self.functions.contains_key(&func.name) {
                return Err(SemanticError::DuplicateFunction {
                    name: func.name.clone(),
                    pos: func.pos,
                });
            }
            if func.params.len() > MAX_PARAMS {
                return Err(SemanticError::TooManyParams {
                    name: func.name.clone(),
                    count: func.params.len(),
                    pos: func.pos,
                });
            }
            self.functions.insert(func.name.clone(), func.params.len());
        }

        if self.functions.get(ENTRY_FUNCTION) != Some(&0) {
            return Err(SemanticError::MissingMain);
        }

        // Second pass: check each function body.
        for func in &program.functions {
            self.check_function(func)?;
        }

        Ok(())
    }

    fn check_function(&mut self, func: &FuncDef) -> Result<(), SemanticError> {
        self.scopes.clear();
        self.scopes.push(HashSet::new());

        for param in &func.params {
            self.declare(&param.name, param.pos)?;
        }

        self.check_block(&func.body)?;
        self.scopes.pop();
        Ok(())
    }

    fn check_block(&mut self, block: &Block) -> Result<(), SemanticError> {
        self.scopes.push(HashSet::new());
        for stmt in &block.stmts {
            self.check_stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Result<(), SemanticError> {
        match stmt {
            Stmt::VarDecl { name, init, pos } => {
                // The initializer is checked first, so a declaration
                // cannot reference itself.
                self.check_expr(init)?;
                self.declare(name, *pos)?;
            }
            Stmt::Assign { name, value, pos } => {
                if !self.is_defined(name) {
                    return Err(SemanticError::UndefinedVariable {
                        name: name.clone(),
                        pos: *pos,
                    });
                }
                self.check_expr(value)?;
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                self.check_expr(cond)?;
                self.check_block(then_block)?;
                if let Some(block) = else_block {
                    self.check_block(block)?;
                }
            }
            Stmt::While { cond, body, .. } => {
                self.check_expr(cond)?;
                self.check_block(body)?;
            }
            Stmt::Return { value, .. } => {
                if let Some(expr) = value {
                    self.check_expr(expr)?;
                }
            }
            Stmt::Print { value, .. } => {
                self.check_expr(value)?;
            }
            Stmt::Expr { expr, .. } => {
                self.check_expr(expr)?;
            }
        }
        Ok(())
    }

    fn check_expr(&mut self, expr: &Expr) -> Result<(), SemanticError> {
        match expr {
            Expr::IntLit(_, _) => {}
            Expr::Ident(name, pos) => {
                if !self.is_defined(name) {
                    return Err(SemanticError::UndefinedVariable {
                        name: name.clone(),
                        pos: *pos,
                    });
                }
            }
            Expr::Binary(left, _, right, _) => {
                self.check_expr(left)?;
                self.check_expr(right)?;
            }
            Expr::Neg(inner, _) => {
                self.check_expr(inner)?;
            }
            Expr::Call(name, args, pos) => {
                match self.functions.get(name) {
                    None => {
                        return Err(SemanticError::UndefinedFunction {
                            name: name.clone(),
                            pos: *pos,
                        });
                    }
                    Some(&arity) if arity != args.len() => {
                        return Err(SemanticError::ArityMismatch {
                            name: name.clone(),
                            expected: arity,
                            found: args.len(),
                            pos: *pos,
                        });
                    }
                    Some(_) => {}
                }
                for arg in args {
                    self.check_expr(arg)?;
                }
            }
        }
        Ok(())
    }

    fn declare(&mut self, name: &str, pos: Pos) -> Result<(), SemanticError> {
        let scope = self
            .scopes
            .last_mut()
            .expect("scope stack is never empty inside a function");
        if !scope.insert(name.to_string()) {
            return Err(SemanticError::DuplicateVariable {
                name: name.to_string(),
                pos,
            });
        }
        Ok(())
    }

    fn is_defined(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|scope| scope.contains(name))
    }
}
