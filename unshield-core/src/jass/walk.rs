//! Traversals over statements and expressions.

use std::collections::{HashMap, HashSet};

use super::syntax::*;

pub fn visit_expr(expr: &Expr, f: &mut dyn FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::ArrayRef(_, index) => visit_expr(index, f),
        Expr::Call(_, args) => args.iter().for_each(|arg| visit_expr(arg, f)),
        Expr::Unary(_, operand) | Expr::Paren(operand) => visit_expr(operand, f),
        Expr::Binary(_, left, right) => {
            visit_expr(left, f);
            visit_expr(right, f);
        }
        _ => {}
    }
}

pub fn visit_expr_mut(expr: &mut Expr, f: &mut dyn FnMut(&mut Expr)) {
    f(expr);
    match expr {
        Expr::ArrayRef(_, index) => visit_expr_mut(index, f),
        Expr::Call(_, args) => args.iter_mut().for_each(|arg| visit_expr_mut(arg, f)),
        Expr::Unary(_, operand) | Expr::Paren(operand) => visit_expr_mut(operand, f),
        Expr::Binary(_, left, right) => {
            visit_expr_mut(left, f);
            visit_expr_mut(right, f);
        }
        _ => {}
    }
}

/// Visits every statement, nested bodies included, before its children.
pub fn visit_statements<'a>(body: &'a [Statement], f: &mut dyn FnMut(&'a Statement)) {
    for stmt in body {
        f(stmt);
        match stmt {
            Statement::If {
                branches,
                else_body,
            } => {
                for (_, body) in branches {
                    visit_statements(body, f);
                }
                if let Some(body) = else_body {
                    visit_statements(body, f);
                }
            }
            Statement::Loop(body) => visit_statements(body, f),
            Statement::Debug(inner) => visit_statements(std::slice::from_ref(&**inner), f),
            _ => {}
        }
    }
}

pub fn visit_statements_mut(body: &mut [Statement], f: &mut dyn FnMut(&mut Statement)) {
    for stmt in body.iter_mut() {
        f(stmt);
        match stmt {
            Statement::If {
                branches,
                else_body,
            } => {
                for (_, body) in branches.iter_mut() {
                    visit_statements_mut(body, f);
                }
                if let Some(body) = else_body {
                    visit_statements_mut(body, f);
                }
            }
            Statement::Loop(body) => visit_statements_mut(body, f),
            Statement::Debug(inner) => visit_statements_mut(std::slice::from_mut(&mut **inner), f),
            _ => {}
        }
    }
}

/// Expressions held directly by one statement, not those of nested bodies.
pub fn statement_exprs(stmt: &Statement) -> Vec<&Expr> {
    match stmt {
        Statement::Local { init, .. } => init.iter().collect(),
        Statement::Set { index, value, .. } => index.iter().chain(Some(value)).collect(),
        Statement::Call { args, .. } => args.iter().collect(),
        Statement::If { branches, .. } => branches.iter().map(|(c, _)| c).collect(),
        Statement::ExitWhen(e) | Statement::Return(Some(e)) => vec![e],
        _ => Vec::new(),
    }
}

pub fn statement_exprs_mut(stmt: &mut Statement) -> Vec<&mut Expr> {
    match stmt {
        Statement::Local { init, .. } => init.iter_mut().collect(),
        Statement::Set { index, value, .. } => index.iter_mut().chain(Some(value)).collect(),
        Statement::Call { args, .. } => args.iter_mut().collect(),
        Statement::If { branches, .. } => branches.iter_mut().map(|(c, _)| c).collect(),
        Statement::ExitWhen(e) | Statement::Return(Some(e)) => vec![e],
        _ => Vec::new(),
    }
}

/// Every expression in `body`, nested bodies and subexpressions included.
pub fn visit_body_exprs(body: &[Statement], f: &mut dyn FnMut(&Expr)) {
    visit_statements(body, &mut |stmt| {
        for e in statement_exprs(stmt) {
            visit_expr(e, f);
        }
    });
}

pub fn visit_body_exprs_mut(body: &mut [Statement], f: &mut dyn FnMut(&mut Expr)) {
    visit_statements_mut(body, &mut |stmt| {
        for e in statement_exprs_mut(stmt) {
            visit_expr_mut(e, f);
        }
    });
}

/// Identifiers referenced by `body` in order of first appearance: variables,
/// assignment targets, called functions and function references.
pub fn identifiers(body: &[Statement]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |name: &str| {
        if seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    };
    visit_statements(body, &mut |stmt| {
        match stmt {
            Statement::Set { name, .. } => push(name),
            Statement::Call { name, .. } => push(name),
            _ => {}
        }
        for e in statement_exprs(stmt) {
            visit_expr(e, &mut |e| match e {
                Expr::Var(name)
                | Expr::ArrayRef(name, _)
                | Expr::Call(name, _)
                | Expr::FunctionRef(name) => push(name),
                _ => {}
            });
        }
    });
    out
}

/// Names of functions a body hands control to: direct calls, function references
/// and `ExecuteFunc("name")`.
pub fn callees(body: &[Statement]) -> Vec<String> {
    let mut out = Vec::new();
    visit_statements(body, &mut |stmt| {
        if let Statement::Call { name, args } = stmt {
            out.push(name.clone());
            if name == "ExecuteFunc" {
                if let Some(target) = args.first().and_then(Expr::string_value) {
                    out.push(target);
                }
            }
        }
        for e in statement_exprs(stmt) {
            visit_expr(e, &mut |e| match e {
                Expr::Call(name, _) | Expr::FunctionRef(name) => out.push(name.clone()),
                _ => {}
            });
        }
    });
    out
}

fn rename_in_body(body: &mut [Statement], renames: &HashMap<String, String>, hidden: &HashSet<&str>) {
    let lookup = |name: &str| -> Option<String> {
        if hidden.contains(name) {
            None
        } else {
            renames.get(name).cloned()
        }
    };
    visit_statements_mut(body, &mut |stmt| {
        if let Statement::Set { name, .. } = stmt {
            if let Some(new) = lookup(name) {
                *name = new;
            }
        }
        for e in statement_exprs_mut(stmt) {
            visit_expr_mut(e, &mut |e| match e {
                Expr::Var(name) | Expr::ArrayRef(name, _) => {
                    if let Some(new) = lookup(name) {
                        *name = new;
                    }
                }
                _ => {}
            });
        }
    });
}

/// Renames global variables. Parameters and locals with the same name hide the
/// global inside their function and are left alone.
pub fn rename_globals(unit: &mut Unit, renames: &HashMap<String, String>) {
    if renames.is_empty() {
        return;
    }
    for decl in unit.declarations.iter_mut() {
        match decl {
            Declaration::Globals(globals) => {
                for g in globals.iter_mut() {
                    if let Some(new) = renames.get(&g.name) {
                        g.name = new.clone();
                    }
                    if let Some(init) = &mut g.init {
                        visit_expr_mut(init, &mut |e| match e {
                            Expr::Var(name) | Expr::ArrayRef(name, _) => {
                                if let Some(new) = renames.get(name.as_str()) {
                                    *name = new.clone();
                                }
                            }
                            _ => {}
                        });
                    }
                }
            }
            Declaration::Function(func) => {
                let scope: Vec<String> =
                    func.scope_names().into_iter().map(str::to_string).collect();
                let hidden: HashSet<&str> = scope.iter().map(String::as_str).collect();
                rename_in_body(&mut func.body, renames, &hidden);
            }
            _ => {}
        }
    }
}

/// Renames functions at their declaration, call sites, `function` references and
/// `ExecuteFunc` string arguments.
pub fn rename_functions(unit: &mut Unit, renames: &HashMap<String, String>) {
    if renames.is_empty() {
        return;
    }
    for func in unit.functions_mut() {
        if let Some(new) = renames.get(&func.name) {
            func.name = new.clone();
        }
        visit_statements_mut(&mut func.body, &mut |stmt| {
            if let Statement::Call { name, args } = stmt {
                if name == "ExecuteFunc" {
                    if let Some(Expr::Str(target)) = args.first_mut() {
                        if let Some(new) = renames.get(target.as_str()) {
                            *target = new.clone();
                        }
                    }
                }
                if let Some(new) = renames.get(name.as_str()) {
                    *name = new.clone();
                }
            }
            for e in statement_exprs_mut(stmt) {
                visit_expr_mut(e, &mut |e| match e {
                    Expr::Call(name, _) | Expr::FunctionRef(name) => {
                        if let Some(new) = renames.get(name.as_str()) {
                            *name = new.clone();
                        }
                    }
                    _ => {}
                });
            }
        });
    }
}
