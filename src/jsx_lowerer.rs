//! JSX Lowering (secondary strategy)
//!
//! Rewrites JSX elements and fragments into automatic-runtime calls
//! (`_jsx`, `_jsxs`, `_Fragment`) without needing semantic analysis. Used when
//! the full transformer rejects a module.

use oxc_allocator::{Allocator, Box as oxc_box, CloneIn};
use oxc_ast::ast::*;
use oxc_ast::AstBuilder;
use oxc_ast_visit::walk_mut::{walk_expression, walk_program};
use oxc_ast_visit::VisitMut;
use oxc_span::SPAN;
use std::collections::HashSet;

pub const JSX_CALLEE: &str = "_jsx";
pub const JSXS_CALLEE: &str = "_jsxs";
pub const FRAGMENT_BINDING: &str = "_Fragment";

// ═══════════════════════════════════════════════════════════════════════════════
// JSX LOWERER
// Transforms JSX elements into _jsx()/_jsxs() runtime calls
// ═══════════════════════════════════════════════════════════════════════════════

pub struct JsxLowerer<'a> {
    pub ast: AstBuilder<'a>,
    used_jsx: bool,
    used_jsxs: bool,
    used_fragment: bool,
    /// Names the module already imports.
    bound: HashSet<String>,
}

impl<'a> JsxLowerer<'a> {
    pub fn new(allocator: &'a Allocator) -> Self {
        Self {
            ast: AstBuilder::new(allocator),
            used_jsx: false,
            used_jsxs: false,
            used_fragment: false,
            bound: HashSet::new(),
        }
    }

    /// Whether any JSX was rewritten.
    pub fn lowered_any(&self) -> bool {
        self.used_jsx || self.used_jsxs
    }

    /// Import statement for the runtime bindings the rewritten code uses and
    /// the module does not already import, or `None` if there are none.
    pub fn runtime_import(&self, import_source: &str) -> Option<String> {
        let wanted = [
            (self.used_fragment, "Fragment", FRAGMENT_BINDING),
            (self.used_jsx, "jsx", JSX_CALLEE),
            (self.used_jsxs, "jsxs", JSXS_CALLEE),
        ];
        let specifiers: Vec<String> = wanted
            .iter()
            .filter(|(used, _, local)| *used && !self.bound.contains(*local))
            .map(|(_, imported, local)| format!("{} as {}", imported, local))
            .collect();
        if specifiers.is_empty() {
            return None;
        }
        Some(format!(
            "import {{ {} }} from \"{}/jsx-runtime\";\n",
            specifiers.join(", "),
            import_source
        ))
    }

    fn lower_jsx_element(&mut self, element: &JSXElement<'a>) -> Expression<'a> {
        let tag = self.tag_expression(&element.opening_element.name);

        let mut props = self.ast.vec();
        let mut key = None;

        for item in &element.opening_element.attributes {
            match item {
                JSXAttributeItem::Attribute(attr) => {
                    let name = match &attr.name {
                        JSXAttributeName::Identifier(id) => id.name.to_string(),
                        JSXAttributeName::NamespacedName(ns) => {
                            format!("{}:{}", ns.namespace.name, ns.name.name)
                        }
                    };

                    let value = match &attr.value {
                        Some(JSXAttributeValue::StringLiteral(s)) => {
                            Expression::StringLiteral(self.ast.alloc((**s).clone()))
                        }
                        Some(JSXAttributeValue::Element(el)) => self.lower_jsx_element(el),
                        Some(JSXAttributeValue::ExpressionContainer(container)) => {
                            self.lower_jsx_expression(&container.expression)
                        }
                        Some(JSXAttributeValue::Fragment(frag)) => self.lower_jsx_fragment(frag),
                        None => self.ast.expression_boolean_literal(SPAN, true),
                    };

                    if name == "key" {
                        key = Some(value);
                        continue;
                    }

                    let prop_key = self.property_key(&name);
                    props.push(self.ast.object_property_kind_object_property(
                        SPAN,
                        PropertyKind::Init,
                        prop_key,
                        value,
                        false,
                        false,
                        false,
                    ));
                }
                JSXAttributeItem::SpreadAttribute(spread) => {
                    let mut spread_expr = spread.argument.clone_in(self.ast.allocator);
                    self.visit_expression(&mut spread_expr);
                    props.push(
                        self.ast
                            .object_property_kind_spread_property(SPAN, spread_expr),
                    );
                }
            }
        }

        let multiple = self.push_children(&mut props, &element.children);
        self.runtime_call(tag, props, key, multiple)
    }

    fn lower_jsx_fragment(&mut self, fragment: &JSXFragment<'a>) -> Expression<'a> {
        self.used_fragment = true;
        let tag = self.ast.expression_identifier(SPAN, FRAGMENT_BINDING);
        let mut props = self.ast.vec();
        let multiple = self.push_children(&mut props, &fragment.children);
        self.runtime_call(tag, props, None, multiple)
    }

    /// Append a `children` property. Returns true when children were passed as
    /// an array (static children, `_jsxs`).
    fn push_children(
        &mut self,
        props: &mut oxc_allocator::Vec<'a, ObjectPropertyKind<'a>>,
        children: &oxc_allocator::Vec<'a, JSXChild<'a>>,
    ) -> bool {
        let mut lowered: Vec<Expression<'a>> = Vec::new();
        for child in children {
            match child {
                JSXChild::Text(t) => {
                    if let Some(text) = clean_jsx_text(&t.value) {
                        let text_atom = self.ast.allocator.alloc_str(&text);
                        lowered.push(self.ast.expression_string_literal(SPAN, text_atom, None));
                    }
                }
                JSXChild::Element(el) => lowered.push(self.lower_jsx_element(el)),
                JSXChild::Fragment(frag) => lowered.push(self.lower_jsx_fragment(frag)),
                JSXChild::ExpressionContainer(container) => {
                    if container.expression.as_expression().is_some() {
                        lowered.push(self.lower_jsx_expression(&container.expression));
                    }
                }
                JSXChild::Spread(spread) => {
                    let mut arg = spread.expression.clone_in(self.ast.allocator);
                    self.visit_expression(&mut arg);
                    lowered.push(arg);
                }
            }
        }

        let multiple = lowered.len() > 1;
        let value = match lowered.len() {
            0 => return false,
            1 => lowered.remove(0),
            _ => {
                let mut elements = self.ast.vec();
                for expr in lowered {
                    elements.push(ArrayExpressionElement::from(expr));
                }
                self.ast.expression_array(SPAN, elements)
            }
        };

        let key = self.property_key("children");
        props.push(self.ast.object_property_kind_object_property(
            SPAN,
            PropertyKind::Init,
            key,
            value,
            false,
            false,
            false,
        ));
        multiple
    }

    fn runtime_call(
        &mut self,
        tag: Expression<'a>,
        props: oxc_allocator::Vec<'a, ObjectPropertyKind<'a>>,
        key: Option<Expression<'a>>,
        multiple: bool,
    ) -> Expression<'a> {
        let callee_name = if multiple {
            self.used_jsxs = true;
            JSXS_CALLEE
        } else {
            self.used_jsx = true;
            JSX_CALLEE
        };

        let mut args = self.ast.vec();
        args.push(Argument::from(tag));
        args.push(Argument::from(self.ast.expression_object(SPAN, props)));
        if let Some(key) = key {
            args.push(Argument::from(key));
        }

        self.ast.expression_call(
            SPAN,
            self.ast.expression_identifier(SPAN, callee_name),
            None::<oxc_box<TSTypeParameterInstantiation>>,
            args,
            false,
        )
    }

    fn property_key(&self, name: &str) -> PropertyKey<'a> {
        let atom = self.ast.allocator.alloc_str(name);
        if is_identifier_name(name) {
            PropertyKey::StaticIdentifier(self.ast.alloc(self.ast.identifier_name(SPAN, atom)))
        } else {
            PropertyKey::StringLiteral(self.ast.alloc_string_literal(SPAN, atom, None))
        }
    }

    /// Intrinsic elements become string literals; components stay references.
    fn tag_expression(&self, name: &JSXElementName<'a>) -> Expression<'a> {
        match name {
            JSXElementName::Identifier(id) => {
                let atom = self.ast.allocator.alloc_str(&id.name);
                self.ast.expression_string_literal(SPAN, atom, None)
            }
            JSXElementName::IdentifierReference(id) => {
                self.ast.expression_identifier(SPAN, id.name.clone())
            }
            JSXElementName::NamespacedName(ns) => {
                let joined = format!("{}:{}", ns.namespace.name, ns.name.name);
                let atom = self.ast.allocator.alloc_str(&joined);
                self.ast.expression_string_literal(SPAN, atom, None)
            }
            JSXElementName::MemberExpression(me) => self.member_expression(me),
            JSXElementName::ThisExpression(_) => self.ast.expression_this(SPAN),
        }
    }

    fn member_expression(&self, me: &JSXMemberExpression<'a>) -> Expression<'a> {
        let object = match &me.object {
            JSXMemberExpressionObject::IdentifierReference(id) => {
                self.ast.expression_identifier(SPAN, id.name.clone())
            }
            JSXMemberExpressionObject::MemberExpression(inner) => self.member_expression(inner),
            JSXMemberExpressionObject::ThisExpression(_) => self.ast.expression_this(SPAN),
        };
        Expression::from(self.ast.member_expression_static(
            SPAN,
            object,
            self.ast.identifier_name(SPAN, me.property.name.clone()),
            false,
        ))
    }

    fn lower_jsx_expression(&mut self, jsx_expr: &JSXExpression<'a>) -> Expression<'a> {
        if let Some(mut e) = jsx_expr
            .as_expression()
            .map(|e| e.clone_in(self.ast.allocator))
        {
            self.visit_expression(&mut e);
            e
        } else {
            self.ast.expression_identifier(SPAN, "undefined")
        }
    }
}

impl<'a> VisitMut<'a> for JsxLowerer<'a> {
    fn visit_program(&mut self, program: &mut Program<'a>) {
        for stmt in &program.body {
            let Statement::ImportDeclaration(decl) = stmt else {
                continue;
            };
            for specifier in decl.specifiers.iter().flatten() {
                let local = match specifier {
                    ImportDeclarationSpecifier::ImportSpecifier(s) => &s.local,
                    ImportDeclarationSpecifier::ImportDefaultSpecifier(s) => &s.local,
                    ImportDeclarationSpecifier::ImportNamespaceSpecifier(s) => &s.local,
                };
                self.bound.insert(local.name.to_string());
            }
        }
        walk_program(self, program);
    }

    fn visit_expression(&mut self, expr: &mut Expression<'a>) {
        match expr {
            Expression::JSXElement(element) => {
                let lowered = self.lower_jsx_element(element);
                *expr = lowered;
            }
            Expression::JSXFragment(fragment) => {
                let lowered = self.lower_jsx_fragment(fragment);
                *expr = lowered;
            }
            _ => walk_expression(self, expr),
        }
    }
}

fn is_identifier_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// JSX text whitespace rules: lines are trimmed, whitespace-only lines are
/// dropped, and the remaining lines join with a single space. A single-line
/// text keeps its inner spacing.
pub fn clean_jsx_text(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw.split('\n').collect();
    let last = lines.len() - 1;
    let mut parts = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let line = line.trim_end_matches('\r');
        let mut trimmed = line;
        if i != 0 {
            trimmed = trimmed.trim_start_matches([' ', '\t']);
        }
        if i != last {
            trimmed = trimmed.trim_end_matches([' ', '\t']);
        }
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}
