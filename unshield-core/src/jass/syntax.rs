//! Syntax tree of a map script.
//!
//! Literals keep their source spelling so rendering a parsed unit reproduces the
//! original numbers and escapes.

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Unit {
    pub declarations: Vec<Declaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Type { name: String, base: String },
    Globals(Vec<Global>),
    Native(Native),
    Function(Function),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub constant: bool,
    pub type_name: String,
    pub is_array: bool,
    pub name: String,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub type_name: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Native {
    pub constant: bool,
    pub name: String,
    pub params: Vec<Param>,
    pub returns: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub constant: bool,
    pub name: String,
    pub params: Vec<Param>,
    pub returns: String,
    pub body: Vec<Statement>,
}

impl Function {
    /// A parameterless function returning nothing with an empty body.
    pub fn new(name: &str) -> Self {
        Self {
            constant: false,
            name: name.to_string(),
            params: Vec::new(),
            returns: "nothing".to_string(),
            body: Vec::new(),
        }
    }

    pub fn has_locals(&self) -> bool {
        self.body
            .iter()
            .any(|stmt| matches!(stmt, Statement::Local { .. }))
    }

    /// Names of parameters and locals, which hide globals of the same name.
    pub fn scope_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.params.iter().map(|p| p.name.as_str()).collect();
        for stmt in &self.body {
            if let Statement::Local { name, .. } = stmt {
                names.push(name);
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Local {
        type_name: String,
        is_array: bool,
        name: String,
        init: Option<Expr>,
    },
    Set {
        name: String,
        index: Option<Expr>,
        value: Expr,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    If {
        branches: Vec<(Expr, Vec<Statement>)>,
        else_body: Option<Vec<Statement>>,
    },
    Loop(Vec<Statement>),
    ExitWhen(Expr),
    Return(Option<Expr>),
    Debug(Box<Statement>),
    Comment(String),
}

impl Statement {
    pub fn call(name: &str, args: Vec<Expr>) -> Self {
        Statement::Call {
            name: name.to_string(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Decimal, `0x`, `$` or octal spelling.
    Integer(String),
    Real(String),
    /// Contents between the single quotes, e.g. `hfoo`.
    FourCC(String),
    /// Contents between the double quotes, escapes untouched.
    Str(String),
    Bool(bool),
    Null,
    Var(String),
    ArrayRef(String, Box<Expr>),
    Call(String, Vec<Expr>),
    FunctionRef(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Paren(Box<Expr>),
}

impl Expr {
    pub fn string(text: &str) -> Self {
        Expr::Str(text.to_string())
    }

    /// Value of a string literal with `\"`, `\\`, `\n` and friends decoded.
    pub fn string_value(&self) -> Option<String> {
        let Expr::Str(raw) = self else {
            return None;
        };
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        Some(out)
    }

    /// Strips any number of enclosing parentheses.
    pub fn unparen(&self) -> &Expr {
        let mut expr = self;
        while let Expr::Paren(inner) = expr {
            expr = inner;
        }
        expr
    }
}

impl Unit {
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.declarations.iter().filter_map(|decl| match decl {
            Declaration::Function(func) => Some(func),
            _ => None,
        })
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.declarations.iter_mut().filter_map(|decl| match decl {
            Declaration::Function(func) => Some(func),
            _ => None,
        })
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions().find(|func| func.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions_mut().find(|func| func.name == name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.function(name).is_some()
    }

    pub fn globals(&self) -> impl Iterator<Item = &Global> {
        self.declarations
            .iter()
            .filter_map(|decl| match decl {
                Declaration::Globals(globals) => Some(globals.iter()),
                _ => None,
            })
            .flatten()
    }

    pub fn globals_mut(&mut self) -> impl Iterator<Item = &mut Global> {
        self.declarations
            .iter_mut()
            .filter_map(|decl| match decl {
                Declaration::Globals(globals) => Some(globals.iter_mut()),
                _ => None,
            })
            .flatten()
    }

    pub fn remove_function(&mut self, name: &str) -> Option<Function> {
        let index = self
            .declarations
            .iter()
            .position(|decl| matches!(decl, Declaration::Function(f) if f.name == name))?;
        match self.declarations.remove(index) {
            Declaration::Function(func) => Some(func),
            _ => None,
        }
    }

    pub fn push_function(&mut self, func: Function) {
        self.declarations.push(Declaration::Function(func));
    }
}
