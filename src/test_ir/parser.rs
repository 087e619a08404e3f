//! Parser for the textual shader IR.
//!
//! ```text
//! ; comments start with a semicolon
//! program fragment
//! input %uv : 2 @texcoord0
//! output %color : 4
//! param %tint : 4 = [1, 0.5, 0.5, 1]
//! texture %base : 2d 4
//! entry:
//!     %c = tex %base, %uv
//!     %color = mul %c, %tint
//!     ret
//! ```
//!
//! Opcodes are the intermediate mnemonics in any case, with `mov` accepted
//! for `asn`. Undeclared destinations become temporaries sized by their result. Literal
//! sources (`0.5`, `[1, 2]`) become constants. A block without a terminator
//! falls through to the next one; `^exit` names the exit node.

use hashbrown::{HashMap, HashSet};

use crate::graph::{
    NodeId, Op, Operand, ProgramGraph, ProgramKind, Semantic, Statement, StmtInfo, Swizzle,
    TextureDims, TextureInfo, Value, ValueId, ValueKind,
};

/// Parse a whole program.
pub fn parse_program(text: &str) -> Result<ProgramGraph, String> {
    let parser = Parser::new(text);
    parser.parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    graph: ProgramGraph,
    blocks: HashMap<&'a str, NodeId>,
    defined: HashSet<&'a str>,
    /// Block names in order of first reference, for error messages.
    referenced: Vec<&'a str>,
    literals: usize,
    statements: usize,
}

/// Where the block being parsed stands.
struct BlockState<'a> {
    name: &'a str,
    node: NodeId,
    pieces: usize,
    /// A conditional branch was seen; only branches may follow.
    branching: bool,
    /// The last statement closed a section; the next one starts a node.
    after_section: bool,
    terminated: bool,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            graph: ProgramGraph::new(ProgramKind::Fragment),
            blocks: HashMap::new(),
            defined: HashSet::new(),
            referenced: Vec::new(),
            literals: 0,
            statements: 0,
        }
    }

    fn parse(mut self) -> Result<ProgramGraph, String> {
        match self.parse_program() {
            Ok(()) => Ok(self.graph),
            Err(e) => Err(format!("line {}: {}", self.line(), e)),
        }
    }

    fn line(&self) -> usize {
        self.text[..self.pos.min(self.text.len())]
            .bytes()
            .filter(|b| *b == b'\n')
            .count()
            + 1
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                while let Some(ch) = self.current_char() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.current_char()
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), String> {
        if !self.try_read(ch) {
            return Err(format!(
                "expected '{}' but found {:?}",
                ch,
                self.current_char()
            ));
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace();
        let start = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(format!("expected identifier but found '{}'", ch)),
            None => return Err("expected identifier but found end of input".to_string()),
        }
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    /// Identifier at the cursor without consuming it.
    fn peek_identifier(&mut self) -> Option<&'a str> {
        let saved = self.pos;
        let ident = self.read_identifier().ok();
        self.pos = saved;
        ident
    }

    fn read_number(&mut self) -> Result<f32, String> {
        self.skip_whitespace();
        let start = self.pos;
        if matches!(self.current_char(), Some('-') | Some('+')) {
            self.advance();
        }
        while let Some(ch) = self.current_char() {
            let exponent_sign =
                matches!(ch, '-' | '+') && matches!(self.text[..self.pos].chars().last(), Some('e' | 'E'));
            if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || exponent_sign {
                self.advance();
            } else {
                break;
            }
        }
        let number = &self.text[start..self.pos];
        number
            .parse()
            .map_err(|e| format!("failed to parse number '{}': {}", number, e))
    }

    fn read_count(&mut self) -> Result<u8, String> {
        let n = self.read_number()?;
        if n.fract() != 0.0 || !(1.0..=4.0).contains(&n) {
            return Err(format!("component count must be 1 to 4, got {}", n));
        }
        Ok(n as u8)
    }

    fn read_vector(&mut self) -> Result<Vec<f32>, String> {
        self.expect('[')?;
        let mut data = vec![self.read_number()?];
        while self.try_read(',') {
            data.push(self.read_number()?);
        }
        self.expect(']')?;
        if data.len() > 4 {
            return Err(format!("vector literal has {} components", data.len()));
        }
        Ok(data)
    }

    fn read_string(&mut self) -> Result<&'a str, String> {
        self.expect('"')?;
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch == '"' {
                let s = &self.text[start..self.pos];
                self.advance();
                return Ok(s);
            }
            if ch == '\n' {
                break;
            }
            self.advance();
        }
        Err("unterminated string".to_string())
    }

    fn read_value_name(&mut self) -> Result<&'a str, String> {
        self.expect('%')?;
        self.read_identifier()
    }

    fn read_swizzle(&mut self) -> Result<Option<Swizzle>, String> {
        if self.current_char() != Some('.') {
            return Ok(None);
        }
        self.advance();
        let text = self.read_identifier()?;
        Swizzle::parse(text)
            .map(Some)
            .ok_or_else(|| format!("bad component selection '.{}'", text))
    }

    fn parse_program(&mut self) -> Result<(), String> {
        match self.read_identifier()? {
            "program" => {}
            other => return Err(format!("expected 'program' but found '{}'", other)),
        }
        self.graph.kind = match self.read_identifier()? {
            "fragment" => ProgramKind::Fragment,
            "vertex" => ProgramKind::Vertex,
            other => return Err(format!("unknown program kind '{}'", other)),
        };

        while let Some(keyword) = self.peek_identifier() {
            let kind = match keyword {
                "input" => ValueKind::Input,
                "output" => ValueKind::Output,
                "temp" => ValueKind::Temp,
                "param" => ValueKind::Param,
                "const" => ValueKind::Const,
                "texture" => ValueKind::Texture,
                _ => break,
            };
            self.read_identifier()?;
            self.parse_declaration(kind)?;
        }

        let mut first = true;
        while !self.is_at_end() {
            self.parse_block(first)?;
            first = false;
        }
        if first {
            return Err("program has no blocks".to_string());
        }
        for name in &self.referenced {
            if !self.defined.contains(name) {
                return Err(format!("branch to undefined block '^{}'", name));
            }
        }
        Ok(())
    }

    fn is_at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.is_eof()
    }

    fn declare(&mut self, value: Value) -> Result<ValueId, String> {
        if self.graph.values().lookup(&value.name).is_some() {
            return Err(format!("%{} declared twice", value.name));
        }
        Ok(self.graph.values_mut().add(value))
    }

    fn parse_declaration(&mut self, kind: ValueKind) -> Result<(), String> {
        let name = self.read_value_name()?;
        let value = match kind {
            ValueKind::Param | ValueKind::Const => {
                let size = if self.try_read(':') {
                    Some(self.read_count()?)
                } else {
                    None
                };
                self.expect('=')?;
                let data = self.read_vector()?;
                if size.is_some_and(|s| s as usize != data.len()) {
                    return Err(format!("%{} has {} values for its size", name, data.len()));
                }
                if kind == ValueKind::Param {
                    Value::param(name, &data)
                } else {
                    Value::constant(name, &data)
                }
            }
            ValueKind::Texture => {
                self.expect(':')?;
                let dims_name = self.read_identifier_or_number()?;
                let dims = TextureDims::from_name(dims_name)
                    .ok_or_else(|| format!("unknown texture target '{}'", dims_name))?;
                let mut info = TextureInfo::new(dims, self.read_count()?);
                if self.peek() == Some('[') {
                    let extent = self.read_vector()?;
                    if extent.len() != 2 {
                        return Err("texture extent needs a width and a height".to_string());
                    }
                    info = info.with_extent(extent[0] as u32, extent[1] as u32);
                }
                Value::texture(name, info)
            }
            _ => {
                self.expect(':')?;
                let mut value = Value {
                    kind,
                    ..Value::temp(name, self.read_count()?)
                };
                if self.try_read('@') {
                    let text = self.read_identifier()?;
                    let semantic = Semantic::parse(text)
                        .ok_or_else(|| format!("unknown semantic '@{}'", text))?;
                    value = value.with_semantic(semantic);
                }
                if self.peek_identifier() == Some("half") {
                    self.read_identifier()?;
                    value = value.with_half();
                }
                value
            }
        };
        self.declare(value)?;
        Ok(())
    }

    /// Texture targets such as `2d` start with a digit.
    fn read_identifier_or_number(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err("expected texture target".to_string());
        }
        Ok(&self.text[start..self.pos])
    }

    fn block_node(&mut self, name: &'a str) -> NodeId {
        if name == "exit" {
            return self.graph.exit();
        }
        if let Some(id) = self.blocks.get(name) {
            return *id;
        }
        let id = self.graph.add_node(Some(name));
        self.blocks.insert(name, id);
        self.referenced.push(name);
        id
    }

    fn read_block_ref(&mut self) -> Result<NodeId, String> {
        self.expect('^')?;
        let name = self.read_identifier()?;
        Ok(self.block_node(name))
    }

    /// Whether a block label starts at the cursor.
    fn at_label(&mut self) -> bool {
        let saved = self.pos;
        let is_label = self.read_identifier().is_ok() && self.try_read(':');
        self.pos = saved;
        is_label
    }

    fn parse_block(&mut self, first: bool) -> Result<(), String> {
        let name = self.read_identifier()?;
        self.expect(':')?;
        if name == "exit" {
            return Err("'exit' is reserved for the exit node".to_string());
        }
        if !self.defined.insert(name) {
            return Err(format!("block '{}' defined twice", name));
        }
        let node = if first {
            let entry = self.graph.entry();
            self.graph.node_mut(entry).name = Some(name.to_string());
            self.blocks.insert(name, entry);
            entry
        } else {
            self.block_node(name)
        };

        let mut state = BlockState {
            name,
            node,
            pieces: 0,
            branching: false,
            after_section: false,
            terminated: false,
        };
        while !self.is_at_end() && !self.at_label() {
            if state.terminated {
                return Err(format!("statement after the terminator of '{}'", name));
            }
            self.parse_statement(&mut state)?;
        }
        if !state.terminated {
            // Fall through to the next block, or to the exit.
            let next = if self.is_at_end() {
                self.graph.exit()
            } else {
                let next = self.peek_identifier().unwrap_or("exit");
                self.block_node(next)
            };
            self.graph.append(state.node, next);
        }
        Ok(())
    }

    /// Continue the block in a fresh node.
    fn split(&mut self, state: &mut BlockState<'a>) {
        state.pieces += 1;
        let piece = self
            .graph
            .add_node(Some(&format!("{}.{}", state.name, state.pieces)));
        self.graph.append(state.node, piece);
        state.node = piece;
        state.after_section = false;
    }

    fn parse_statement(&mut self, state: &mut BlockState<'a>) -> Result<(), String> {
        if self.peek() == Some('%') {
            return self.parse_assignment(state);
        }
        let keyword = self.read_identifier()?;
        match keyword {
            "brc" => {
                let cond = self.parse_operand()?;
                if cond.size() != 1 {
                    return Err("branch condition must select one component".to_string());
                }
                self.expect(',')?;
                let target = self.read_block_ref()?;
                self.graph.append_cond(state.node, cond, target);
                state.branching = true;
                state.after_section = false;
            }
            "br" => {
                let target = self.read_block_ref()?;
                self.graph.append(state.node, target);
                state.terminated = true;
            }
            "ret" => {
                let exit = self.graph.exit();
                self.graph.append(state.node, exit);
                state.terminated = true;
            }
            "startsec" => {
                let name = if self.peek() == Some('"') {
                    Some(self.read_string()?)
                } else {
                    None
                };
                self.begin_statement(state)?;
                if !self.graph.node(state.node).statements().is_empty() {
                    self.split(state);
                }
                self.graph
                    .push_statement(state.node, Statement::marker(Op::StartSec, name));
            }
            "endsec" => {
                self.begin_statement(state)?;
                self.graph
                    .push_statement(state.node, Statement::marker(Op::EndSec, None));
                state.after_section = true;
            }
            "kil" => {
                let src = self.parse_operand()?;
                self.begin_statement(state)?;
                self.push(state, Statement::new(Op::Kil, None, vec![src]));
            }
            other => return Err(format!("unknown statement '{}'", other)),
        }
        Ok(())
    }

    fn begin_statement(&mut self, state: &mut BlockState<'a>) -> Result<(), String> {
        if state.branching {
            return Err(format!(
                "statement after a conditional branch in '{}'",
                state.name
            ));
        }
        if state.after_section {
            self.split(state);
        }
        Ok(())
    }

    fn push(&mut self, state: &BlockState<'a>, stmt: Statement) {
        let stmt = stmt.with_info(StmtInfo::Origin(self.statements));
        self.statements += 1;
        self.graph.push_statement(state.node, stmt);
    }

    fn parse_assignment(&mut self, state: &mut BlockState<'a>) -> Result<(), String> {
        let dest_name = self.read_value_name()?;
        let mask = self.read_swizzle()?;
        if mask.is_some_and(|m| !m.is_mask()) {
            return Err(format!("%{} is written with a repeated component", dest_name));
        }
        self.expect('=')?;
        let op_name = self.read_identifier()?;
        let op = match op_name {
            "mov" => Some(Op::Asn),
            _ => Op::from_name(op_name),
        }
        .ok_or_else(|| format!("unknown opcode '{}'", op_name))?;
        if !op.has_result() {
            return Err(format!("{} has no result", op));
        }

        let mut srcs = Vec::with_capacity(op.info().arity);
        for i in 0..op.info().arity {
            if i > 0 {
                self.expect(',')?;
            }
            srcs.push(self.parse_operand()?);
        }

        let dest = match self.graph.values().lookup(dest_name) {
            Some(id) => id,
            None => {
                let sizes: Vec<u8> = srcs.iter().map(|s| s.size()).collect();
                let result = match op.result_size(&sizes) {
                    Some(size) => size,
                    None => self.texture_channels(&srcs[0])?,
                };
                let size = match mask {
                    Some(m) => m.comps().iter().max().map_or(1, |c| c + 1),
                    None => result,
                };
                self.declare(Value::temp(dest_name, size))?
            }
        };
        let size = self.graph.values().get(dest).size;
        let mask = mask.unwrap_or_else(|| Swizzle::identity(size));
        if mask.comps().iter().any(|c| *c >= size) {
            return Err(format!("%{} has only {} components", dest_name, size));
        }
        self.begin_statement(state)?;
        self.push(
            state,
            Statement::new(op, Some(Operand::new(dest, mask)), srcs),
        );
        Ok(())
    }

    fn texture_channels(&self, operand: &Operand) -> Result<u8, String> {
        self.graph
            .values()
            .get(operand.value)
            .texture
            .map(|t| t.channels)
            .ok_or_else(|| {
                format!(
                    "%{} is not a texture",
                    self.graph.values().get(operand.value).name
                )
            })
    }

    fn literal(&mut self, data: &[f32]) -> Result<Operand, String> {
        let name = format!("_k{}", self.literals);
        self.literals += 1;
        let id = self.declare(Value::constant(&name, data))?;
        Ok(self.graph.values().operand(id))
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        let mut neg = false;
        if self.peek() == Some('-') {
            let next = self.text[self.pos + 1..].chars().next();
            if next == Some('%') || next == Some('[') {
                self.advance();
                neg = true;
            }
        }
        let operand = match self.peek() {
            Some('%') => {
                let name = self.read_value_name()?;
                let id = self
                    .graph
                    .values()
                    .lookup(name)
                    .ok_or_else(|| format!("use of undeclared value %{}", name))?;
                let size = self.graph.values().get(id).size;
                match self.read_swizzle()? {
                    Some(swz) => {
                        if swz.comps().iter().any(|c| *c >= size) {
                            return Err(format!("%{} has only {} components", name, size));
                        }
                        Operand::new(id, swz)
                    }
                    None => self.graph.values().operand(id),
                }
            }
            Some('[') => {
                let data = self.read_vector()?;
                self.literal(&data)?
            }
            _ => {
                let value = self.read_number()?;
                self.literal(&[value])?
            }
        };
        Ok(if neg { operand.negated() } else { operand })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_straight_line() {
        let graph = parse_program(
            "program fragment\n\
             input %uv : 2 @texcoord0\n\
             output %color : 4\n\
             param %tint : 4 = [1, 0.5, 0.5, 1]\n\
             entry:\n\
             \x20 %t = mul %uv.xyxy, %tint ; scale\n\
             \x20 %color = add %t, 0.25\n\
             \x20 ret\n",
        )
        .unwrap();
        assert_eq!(graph.kind, ProgramKind::Fragment);
        let entry = graph.node(graph.entry());
        assert_eq!(entry.statements().len(), 2);
        assert_eq!(entry.follower, Some(graph.exit()));
        let t = graph.values().lookup("t").unwrap();
        assert_eq!(graph.values().get(t).size, 4);
        assert_eq!(graph.values().get(t).kind, ValueKind::Temp);
        assert_eq!(entry.statements()[1].origin(), Some(1));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_parse_branches_and_fallthrough() {
        let graph = parse_program(
            "program vertex\n\
             input %a : 1\n\
             output %o : 1\n\
             entry:\n\
             \x20 brc %a.x, ^then\n\
             else:\n\
             \x20 %o = mov 0\n\
             \x20 br ^exit\n\
             then:\n\
             \x20 %o = mov -%a\n",
        )
        .unwrap();
        let entry = graph.node(graph.entry());
        assert_eq!(entry.succs.len(), 1);
        let then = entry.succs[0].target;
        assert_eq!(graph.node_name(then), "then");
        assert_eq!(graph.node(then).follower, Some(graph.exit()));
        let else_node = entry.follower.unwrap();
        assert_eq!(graph.node_name(else_node), "else");
        assert!(graph.node(then).statements()[0].src[0].neg);
    }

    #[test]
    fn test_sections_split_blocks() {
        let graph = parse_program(
            "program fragment\n\
             output %o : 1\n\
             entry:\n\
             \x20 %o = mov 1\n\
             \x20 startsec \"shade\"\n\
             \x20 %o = mov 2\n\
             \x20 endsec\n\
             \x20 %o = mov 3\n\
             \x20 ret\n",
        )
        .unwrap();
        let entry = graph.node(graph.entry());
        assert_eq!(entry.statements().len(), 1);
        let sec = graph.node(entry.follower.unwrap());
        assert_eq!(sec.statements().first().unwrap().op, Op::StartSec);
        assert_eq!(sec.statements().last().unwrap().op, Op::EndSec);
        assert_eq!(sec.statements()[0].section_name(), Some("shade"));
        let tail = graph.node(sec.follower.unwrap());
        assert_eq!(tail.statements().len(), 1);
        assert_eq!(tail.follower, Some(graph.exit()));
    }

    #[test]
    fn test_texture_result_takes_channel_count() {
        let graph = parse_program(
            "program fragment\n\
             input %uv : 2\n\
             texture %lum : rect 2 [64, 32]\n\
             entry:\n\
             \x20 %c = tex %lum, %uv\n",
        )
        .unwrap();
        let c = graph.values().lookup("c").unwrap();
        assert_eq!(graph.values().get(c).size, 2);
        let lum = graph.values().lookup("lum").unwrap();
        let info = graph.values().get(lum).texture.unwrap();
        assert_eq!(info.dims, TextureDims::Rect);
        assert_eq!(info.extent, [64, 32]);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse_program("program fragment\nentry:\n  %x = frob %y\n").unwrap_err();
        assert!(err.starts_with("line 3:"), "{}", err);
        let err = parse_program("program fragment\nentry:\n  br ^nowhere\n").unwrap_err();
        assert!(err.contains("undefined block"), "{}", err);
    }
}
