//! Nested joins.
//!
//! The FROM clause is kept as a tree of join nodes: leaves are tables, inner nodes are the
//! parenthesized groups of an outer join (`t1 LEFT JOIN (t2, t3) ON ...`). Nodes live in a petgraph
//! arena, edges go from a nest to its members and are weighted by the member position.

use anyhow::{anyhow, bail};
use petgraph::prelude::{NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, NodeIndexable};
use petgraph::{Directed, Direction};

use crate::catalog::TableDef;
use crate::equality::{EqualityContext, FrameId};
use crate::error::OptResult;
use crate::predicate::{and_conds, Predicate};
use crate::table_map::{TableMap, TableNo, MAX_TABLES};

pub type JoinNodeId = NodeIndex;

/// Bitmap of nested joins, one bit per nest that can be interleaved with other tables.
pub type NestedJoinMap = u64;

/// An element of a join list, as written in the query.
#[derive(Clone, Debug)]
pub struct JoinClause {
    pub operand: JoinOperand,
    /// Inner side of a LEFT JOIN.
    pub outer: bool,
    pub on: Option<Predicate>,
}

#[derive(Clone, Debug)]
pub enum JoinOperand {
    Table(TableNo),
    Nest(Vec<JoinClause>),
}

impl JoinClause {
    pub fn table(table: TableNo) -> Self {
        Self {
            operand: JoinOperand::Table(table),
            outer: false,
            on: None,
        }
    }

    pub fn nest(members: Vec<JoinClause>) -> Self {
        Self {
            operand: JoinOperand::Nest(members),
            outer: false,
            on: None,
        }
    }

    /// Makes this operand the inner side of a LEFT JOIN.
    pub fn left_join_on(mut self, on: Predicate) -> Self {
        self.outer = true;
        self.on = Some(on);
        self
    }

    /// Joins this operand with an inner join condition.
    pub fn join_on(mut self, on: Predicate) -> Self {
        self.on = Some(on);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct JoinNode {
    /// `None` for nests.
    pub table: Option<TableNo>,
    pub on_expr: Option<Predicate>,
    pub outer_join: bool,
    /// Tables which must precede this node in any join order.
    pub dep_tables: TableMap,
    pub on_expr_dep_tables: TableMap,
    /// Tables of the subtree.
    pub used_tables: TableMap,
    pub not_null_tables: TableMap,
    pub nj_map: NestedJoinMap,
    /// Multiple equalities of the ON expression.
    pub on_frame: Option<FrameId>,
}

impl JoinNode {
    fn of_table(table: TableNo) -> Self {
        Self {
            table: Some(table),
            used_tables: TableMap::of(table),
            ..Default::default()
        }
    }

    pub fn is_nest(&self) -> bool {
        self.table.is_none()
    }
}

/// Per table summary of the nesting, computed by [`JoinTree::prepare`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TableNesting {
    /// Bits of all nests the table is embedded in.
    pub embedding_map: NestedJoinMap,
    /// Transitive closure of the tables that must be joined before this one.
    pub dependent: TableMap,
    /// The table is an inner table of some outer join.
    pub maybe_null: bool,
}

type JoinGraph = StableGraph<JoinNode, usize, Directed>;

#[derive(Clone, Debug)]
pub struct JoinTree {
    graph: JoinGraph,
    root: JoinNodeId,
    table_nodes: Vec<JoinNodeId>,
    nesting: Vec<TableNesting>,
}

impl JoinTree {
    /// Builds the tree of a FROM clause over `table_count` tables.
    pub fn new(items: Vec<JoinClause>, table_count: usize) -> OptResult<Self> {
        if table_count > MAX_TABLES {
            bail!("too many tables in join: {} (at most {})", table_count, MAX_TABLES);
        }
        let mut graph = JoinGraph::default();
        let root = graph.add_node(JoinNode::default());
        let mut tree = Self {
            graph,
            root,
            table_nodes: vec![NodeIndex::end(); table_count],
            nesting: vec![TableNesting::default(); table_count],
        };
        tree.add_members(root, items)?;
        if let Some(missing) = tree.table_nodes.iter().position(|n| *n == NodeIndex::end()) {
            bail!("table #{} is not part of the join", missing);
        }
        Ok(tree)
    }

    fn add_members(&mut self, owner: JoinNodeId, items: Vec<JoinClause>) -> OptResult<()> {
        if items.is_empty() {
            bail!("empty join list");
        }
        if items[0].outer {
            bail!("the first operand of a join list can not be the inner side of an outer join");
        }
        for (pos, item) in items.into_iter().enumerate() {
            if item.outer && item.on.is_none() {
                bail!("outer join without ON condition");
            }
            let node = match item.operand {
                JoinOperand::Table(table) => {
                    let slot = self
                        .table_nodes
                        .get(table)
                        .copied()
                        .ok_or_else(|| anyhow!("unknown table #{} in join", table))?;
                    if slot != NodeIndex::end() {
                        bail!("table #{} appears twice in the join", table);
                    }
                    let node = self.graph.add_node(JoinNode::of_table(table));
                    self.table_nodes[table] = node;
                    node
                }
                JoinOperand::Nest(members) => {
                    let node = self.graph.add_node(JoinNode::default());
                    self.add_members(node, members)?;
                    node
                }
            };
            self.graph[node].outer_join = item.outer;
            self.graph[node].on_expr = item.on;
            self.graph.add_edge(owner, node, pos);
        }
        Ok(())
    }

    pub fn root(&self) -> JoinNodeId {
        self.root
    }

    pub fn node(&self, id: JoinNodeId) -> &JoinNode {
        &self.graph[id]
    }

    pub fn node_mut(&mut self, id: JoinNodeId) -> &mut JoinNode {
        &mut self.graph[id]
    }

    pub fn table_node(&self, table: TableNo) -> JoinNodeId {
        self.table_nodes[table]
    }

    pub fn table_count(&self) -> usize {
        self.table_nodes.len()
    }

    pub fn nesting(&self, table: TableNo) -> &TableNesting {
        &self.nesting[table]
    }

    /// Members of a nest (or of the top level join list), in query order.
    pub fn children(&self, owner: JoinNodeId) -> Vec<JoinNodeId> {
        let mut edges = self
            .graph
            .edges_directed(owner, Direction::Outgoing)
            .map(|e| (*e.weight(), e.target()))
            .collect::<Vec<_>>();
        edges.sort();
        edges.into_iter().map(|(_, n)| n).collect()
    }

    fn set_children(&mut self, owner: JoinNodeId, members: Vec<JoinNodeId>) {
        let old = self
            .graph
            .edges_directed(owner, Direction::Outgoing)
            .map(|e| e.id())
            .collect::<Vec<_>>();
        for edge in old {
            self.graph.remove_edge(edge);
        }
        for (pos, member) in members.into_iter().enumerate() {
            let stale = self
                .graph
                .edges_directed(member, Direction::Incoming)
                .map(|e| e.id())
                .collect::<Vec<_>>();
            for edge in stale {
                self.graph.remove_edge(edge);
            }
            self.graph.add_edge(owner, member, pos);
        }
    }

    /// The nest directly containing `node`, `None` on the top level.
    pub fn embedding(&self, node: JoinNodeId) -> Option<JoinNodeId> {
        self.graph
            .neighbors_directed(node, Direction::Incoming)
            .next()
            .filter(|parent| *parent != self.root)
    }

    /// Nests containing `node`, innermost first.
    pub fn embeddings(&self, node: JoinNodeId) -> impl Iterator<Item = JoinNodeId> + '_ {
        std::iter::successors(self.embedding(node), move |n| self.embedding(*n))
    }

    /// Tables of all inner sides of outer joins.
    pub fn outer_join_tables(&self) -> TableMap {
        TableMap::from_tables((0..self.table_count()).filter(|t| self.nesting[*t].maybe_null))
    }

    /// Simplifies the join structure, assigns nest bitmaps and computes table dependencies.
    ///
    /// Returns the WHERE condition extended with the ON conditions of joins converted to inner
    /// joins.
    pub fn prepare(&mut self, conds: Option<Predicate>) -> OptResult<Option<Predicate>> {
        let conds = self.simplify_joins(self.root, conds, true);
        self.unwrap_single_member_nests(self.root);
        let used_bits = self.build_bitmap_for_nested_joins(self.root, 0);
        if used_bits > NestedJoinMap::BITS {
            bail!("too many nested joins");
        }
        self.compute_nesting()?;
        Ok(conds)
    }

    /// Converts outer joins whose inner tables are null rejected by the enclosing condition to
    /// inner joins, and flattens nests left without an ON condition.
    fn simplify_joins(
        &mut self,
        owner: JoinNodeId,
        mut conds: Option<Predicate>,
        top: bool,
    ) -> Option<Predicate> {
        let embedded = owner != self.root;
        let mut prev: Option<JoinNodeId> = None;

        // Later members are looked at first, so the innermost outer join is converted first.
        for node in self.children(owner).into_iter().rev() {
            let (used_tables, not_null_tables) = if self.graph[node].is_nest() {
                if let Some(on) = self.graph[node].on_expr.take() {
                    let on = self.simplify_joins(node, Some(on), false);
                    self.graph[node].on_expr = on;
                }
                self.graph[node].used_tables = TableMap::EMPTY;
                self.graph[node].not_null_tables = TableMap::EMPTY;
                conds = self.simplify_joins(node, conds, top);
                (self.graph[node].used_tables, self.graph[node].not_null_tables)
            } else {
                (
                    self.graph[node].used_tables,
                    conds
                        .as_ref()
                        .map_or(TableMap::EMPTY, |c| c.not_null_tables()),
                )
            };

            if embedded {
                self.graph[owner].used_tables |= used_tables;
                self.graph[owner].not_null_tables |= not_null_tables;
            }

            if !self.graph[node].outer_join || used_tables.intersects(not_null_tables) {
                if self.graph[node].outer_join {
                    log::debug!("outer join on {:?} converted to inner join", used_tables);
                }
                self.graph[node].outer_join = false;
                if let Some(on) = self.graph[node].on_expr.take() {
                    conds = and_conds(conds, Some(on));
                }
            }

            if !top {
                continue;
            }

            if let Some(on_used) = self.graph[node].on_expr.as_ref().map(|on| on.used_tables()) {
                self.graph[node].dep_tables |= on_used;
                if embedded {
                    let owner_used = self.graph[owner].used_tables;
                    self.graph[node].dep_tables &= !owner_used;
                    self.graph[owner].on_expr_dep_tables |= on_used;
                } else {
                    self.graph[node].dep_tables &= !used_tables;
                }
            }

            if let Some(prev) = prev {
                if let Some(prev_on_used) =
                    self.graph[prev].on_expr.as_ref().map(|on| on.used_tables())
                {
                    let on_expr_dep = self.graph[node].on_expr_dep_tables;
                    let prev_used = self.graph[prev].used_tables;
                    let prev_node = &mut self.graph[prev];
                    prev_node.dep_tables |= on_expr_dep;
                    // An ON condition referring to inner tables only still needs the outer ones.
                    if prev_on_used.is_subset_of(prev_used) {
                        prev_node.dep_tables |= used_tables;
                    }
                }
            }
            prev = Some(node);
        }

        let mut members = vec![];
        let mut flattened = false;
        for node in self.children(owner) {
            if self.graph[node].is_nest() && self.graph[node].on_expr.is_none() {
                members.extend(self.children(node));
                self.graph.remove_node(node);
                flattened = true;
            } else {
                members.push(node);
            }
        }
        if flattened {
            self.set_children(owner, members);
        }
        conds
    }

    /// A nest with a single member is replaced by the member, which takes over the ON condition.
    fn unwrap_single_member_nests(&mut self, owner: JoinNodeId) {
        let mut members = vec![];
        let mut changed = false;
        for node in self.children(owner) {
            if !self.graph[node].is_nest() {
                members.push(node);
                continue;
            }
            self.unwrap_single_member_nests(node);
            let inner = self.children(node);
            if inner.len() == 1 && self.graph[inner[0]].on_expr.is_none() {
                let member = inner[0];
                let nest = self.graph[node].clone();
                let target = &mut self.graph[member];
                target.on_expr = nest.on_expr;
                target.outer_join = nest.outer_join;
                target.dep_tables |= nest.dep_tables;
                target.on_expr_dep_tables |= nest.on_expr_dep_tables;
                self.graph.remove_node(node);
                members.push(member);
                changed = true;
            } else {
                members.push(node);
            }
        }
        if changed {
            self.set_children(owner, members);
        }
    }

    fn build_bitmap_for_nested_joins(&mut self, owner: JoinNodeId, mut first_unused: u32) -> u32 {
        for node in self.children(owner) {
            if !self.graph[node].is_nest() {
                continue;
            }
            if self.children(node).len() != 1 {
                if self.graph[node].on_expr.is_some() && first_unused < NestedJoinMap::BITS {
                    self.graph[node].nj_map = 1 << first_unused;
                }
                first_unused += u32::from(self.graph[node].on_expr.is_some());
                first_unused = self.build_bitmap_for_nested_joins(node, first_unused);
            }
        }
        first_unused
    }

    fn compute_nesting(&mut self) -> OptResult<()> {
        let count = self.table_count();
        for table in 0..count {
            let node = self.table_nodes[table];
            let mut nesting = TableNesting {
                embedding_map: 0,
                dependent: self.graph[node].dep_tables,
                maybe_null: self.graph[node].outer_join,
            };
            for nest in self.embeddings(node).collect::<Vec<_>>() {
                let nest = &self.graph[nest];
                nesting.embedding_map |= nest.nj_map;
                nesting.dependent |= nest.dep_tables;
                nesting.maybe_null |= nest.outer_join;
            }
            self.nesting[table] = nesting;
        }

        // Transitive closure of the dependencies.
        loop {
            let mut changed = false;
            for i in 0..count {
                let mut dependent = self.nesting[i].dependent;
                for j in self.nesting[i].dependent.iter() {
                    dependent |= self.nesting[j].dependent;
                }
                if dependent != self.nesting[i].dependent {
                    self.nesting[i].dependent = dependent;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        if let Some(t) = (0..count).find(|t| self.nesting[*t].dependent.contains(*t)) {
            bail!("cross dependency found in OUTER JOIN for table #{}", t);
        }
        Ok(())
    }

    /// Builds multiple equalities of all ON conditions. Each ON condition inherits the
    /// equalities of the condition enclosing it, starting with the WHERE clause.
    pub fn build_equal_items(
        &mut self,
        ctx: &mut EqualityContext,
        defs: &[TableDef],
        where_frame: Option<FrameId>,
    ) {
        self.build_equal_items_for_list(ctx, defs, self.root, where_frame)
    }

    fn build_equal_items_for_list(
        &mut self,
        ctx: &mut EqualityContext,
        defs: &[TableDef],
        owner: JoinNodeId,
        inherited: Option<FrameId>,
    ) {
        for node in self.children(owner) {
            let mut nested_inherited = inherited;
            if let Some(on) = self.graph[node].on_expr.take() {
                let (on, frame) = ctx.build_equal_items(defs, on, inherited);
                self.graph[node].on_expr = Some(on);
                self.graph[node].on_frame = frame;
                nested_inherited = frame;
            }
            if self.graph[node].is_nest() {
                self.build_equal_items_for_list(ctx, defs, node, nested_inherited);
            }
        }
    }

    /// All nodes carrying an ON condition, in depth-first query order.
    pub fn nodes_with_on_expr(&self) -> Vec<JoinNodeId> {
        let mut out = vec![];
        let mut stack = vec![self.root];
        while let Some(owner) = stack.pop() {
            for node in self.children(owner).into_iter().rev() {
                if self.graph[node].is_nest() {
                    stack.push(node);
                }
            }
            for node in self.children(owner) {
                if self.graph[node].on_expr.is_some() {
                    out.push(node);
                }
            }
        }
        out
    }
}

/// Checks that a join order built table by table does not interleave a nest with tables outside
/// of it.
pub struct JoinOrderValidator<'a> {
    tree: &'a JoinTree,
    cur_embedding_map: NestedJoinMap,
    counters: Vec<usize>,
    member_counts: Vec<usize>,
}

impl<'a> JoinOrderValidator<'a> {
    pub fn new(tree: &'a JoinTree) -> Self {
        let bound = tree.graph.node_bound();
        let mut member_counts = vec![0; bound];
        for node in tree.graph.node_indices() {
            member_counts[node.index()] = tree.children(node).len();
        }
        Self {
            tree,
            cur_embedding_map: 0,
            counters: vec![0; bound],
            member_counts,
        }
    }

    pub fn cur_embedding_map(&self) -> NestedJoinMap {
        self.cur_embedding_map
    }

    /// Adds `table` to the partial order if that keeps every nest contiguous.
    ///
    /// Nests whose first table was placed but not the last are "open". A table may only be added
    /// if it is inside every open nest.
    pub fn can_extend(&mut self, table: TableNo) -> bool {
        if self.cur_embedding_map & !self.tree.nesting(table).embedding_map != 0 {
            return false;
        }
        for nest in self.tree.embeddings(self.tree.table_node(table)) {
            let idx = nest.index();
            self.counters[idx] += 1;
            if self.counters[idx] == 1 {
                self.cur_embedding_map |= self.tree.node(nest).nj_map;
            }
            if self.counters[idx] != self.member_counts[idx] {
                break;
            }
            self.cur_embedding_map &= !self.tree.node(nest).nj_map;
        }
        true
    }

    /// Undoes the last accepted [`Self::can_extend`] of `table`.
    pub fn retract(&mut self, table: TableNo) {
        for nest in self.tree.embeddings(self.tree.table_node(table)) {
            let idx = nest.index();
            let was_fully_covered = self.counters[idx] == self.member_counts[idx];
            self.counters[idx] -= 1;
            if self.counters[idx] == 0 {
                self.cur_embedding_map &= !self.tree.node(nest).nj_map;
            } else if was_fully_covered {
                self.cur_embedding_map |= self.tree.node(nest).nj_map;
            }
            if !was_fully_covered {
                break;
            }
        }
    }
}
