use std::fmt::Write;

use super::syntax::*;

const INDENT: &str = "    ";

fn params(params: &[Param]) -> String {
    if params.is_empty() {
        "nothing".to_string()
    } else {
        params
            .iter()
            .map(|p| format!("{} {}", p.type_name, p.name))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn expr(e: &Expr) -> String {
    match e {
        Expr::Integer(raw) | Expr::Real(raw) => raw.clone(),
        Expr::FourCC(raw) => format!("'{raw}'"),
        Expr::Str(raw) => format!("\"{raw}\""),
        Expr::Bool(value) => value.to_string(),
        Expr::Null => "null".to_string(),
        Expr::Var(name) => name.clone(),
        Expr::ArrayRef(name, index) => format!("{name}[{}]", expr(index)),
        Expr::Call(name, args) => format!("{name}({})", arguments(args)),
        Expr::FunctionRef(name) => format!("function {name}"),
        Expr::Unary(UnaryOp::Neg, operand) => format!("-{}", expr(operand)),
        Expr::Unary(UnaryOp::Plus, operand) => format!("+{}", expr(operand)),
        Expr::Unary(UnaryOp::Not, operand) => format!("not {}", expr(operand)),
        Expr::Binary(op, left, right) => {
            format!("{} {} {}", expr(left), op.symbol(), expr(right))
        }
        Expr::Paren(inner) => format!("({})", expr(inner)),
    }
}

fn arguments(args: &[Expr]) -> String {
    args.iter().map(expr).collect::<Vec<_>>().join(", ")
}

fn statement_line(stmt: &Statement) -> Option<String> {
    let line = match stmt {
        Statement::Local {
            type_name,
            is_array,
            name,
            init,
        } => {
            let array = if *is_array { " array" } else { "" };
            match init {
                Some(init) => format!("local {type_name}{array} {name} = {}", expr(init)),
                None => format!("local {type_name}{array} {name}"),
            }
        }
        Statement::Set { name, index, value } => match index {
            Some(index) => format!("set {name}[{}] = {}", expr(index), expr(value)),
            None => format!("set {name} = {}", expr(value)),
        },
        Statement::Call { name, args } => format!("call {name}({})", arguments(args)),
        Statement::ExitWhen(condition) => format!("exitwhen {}", expr(condition)),
        Statement::Return(Some(value)) => format!("return {}", expr(value)),
        Statement::Return(None) => "return".to_string(),
        Statement::Debug(inner) => format!("debug {}", statement_line(inner)?),
        Statement::Comment(text) => format!("//{text}"),
        Statement::If { .. } | Statement::Loop(_) => return None,
    };
    Some(line)
}

pub fn statements(out: &mut String, body: &[Statement], depth: usize) {
    let pad = INDENT.repeat(depth);
    for stmt in body {
        if let Some(line) = statement_line(stmt) {
            let _ = writeln!(out, "{pad}{line}");
            continue;
        }
        match stmt {
            Statement::If {
                branches,
                else_body,
            } => {
                for (i, (condition, body)) in branches.iter().enumerate() {
                    let keyword = if i == 0 { "if" } else { "elseif" };
                    let _ = writeln!(out, "{pad}{keyword} {} then", expr(condition));
                    statements(out, body, depth + 1);
                }
                if let Some(body) = else_body {
                    let _ = writeln!(out, "{pad}else");
                    statements(out, body, depth + 1);
                }
                let _ = writeln!(out, "{pad}endif");
            }
            Statement::Loop(body) => {
                let _ = writeln!(out, "{pad}loop");
                statements(out, body, depth + 1);
                let _ = writeln!(out, "{pad}endloop");
            }
            _ => {}
        }
    }
}

pub fn global(g: &Global) -> String {
    let constant = if g.constant { "constant " } else { "" };
    let array = if g.is_array { " array" } else { "" };
    match &g.init {
        Some(init) => format!(
            "{constant}{}{array} {} = {}",
            g.type_name,
            g.name,
            expr(init)
        ),
        None => format!("{constant}{}{array} {}", g.type_name, g.name),
    }
}

pub fn function(out: &mut String, f: &Function) {
    let constant = if f.constant { "constant " } else { "" };
    let _ = writeln!(
        out,
        "{constant}function {} takes {} returns {}",
        f.name,
        params(&f.params),
        f.returns
    );
    statements(out, &f.body, 1);
    let _ = writeln!(out, "endfunction");
}

pub fn unit(u: &Unit) -> String {
    let mut out = String::new();
    for decl in &u.declarations {
        match decl {
            Declaration::Type { name, base } => {
                let _ = writeln!(out, "type {name} extends {base}");
            }
            Declaration::Globals(globals) => {
                let _ = writeln!(out, "globals");
                for g in globals {
                    let _ = writeln!(out, "{INDENT}{}", global(g));
                }
                let _ = writeln!(out, "endglobals");
            }
            Declaration::Native(n) => {
                let constant = if n.constant { "constant " } else { "" };
                let _ = writeln!(
                    out,
                    "{constant}native {} takes {} returns {}",
                    n.name,
                    params(&n.params),
                    n.returns
                );
            }
            Declaration::Function(f) => {
                function(&mut out, f);
                out.push('\n');
            }
            Declaration::Comment(text) => {
                let _ = writeln!(out, "//{text}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::jass::parse;

    #[test]
    fn rendering_is_stable_after_one_round() {
        let src = "globals\nunit array  udg_a\nconstant real X=-1.50\nendglobals\n\
                   function f takes integer n returns boolean\n\
                   if n==0 then\nreturn(true)\nelseif n>1 then\nset udg_a[n]=null\nelse\nloop\nexitwhen n<0\nendloop\nendif\n\
                   return not f(n-1) and 'A000'!=n\nendfunction\n";
        let first = parse(src).unwrap().render();
        assert!(first.contains("    unit array udg_a\n"));
        assert!(first.contains("    constant real X = -1.50\n"));
        assert!(first.contains("        return (true)\n"));
        assert!(first.contains("            exitwhen n < 0\n"));
        assert!(first.contains("    return not f(n - 1) and 'A000' != n\n"));
        assert_eq!(parse(&first).unwrap().render(), first);
    }
}
